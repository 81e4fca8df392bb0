//! Tiered quality gates run after each agent attempt.
//!
//! Hard gates (implementation, test, review) feed the Ralph Loop on failure.
//! The quality gate is soft: a failing lint only logs a warning.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::config::{Config, GateConfig, TimeoutConfig};
use crate::core::Task;
use crate::orchestration::process::{ProcessOutcome, ShellCommand};
use crate::util::truncate_tail;
use crate::Result;

/// Env var carrying the task id to every subprocess.
pub const TASK_ID_ENV: &str = "WAVEFRONT_TASK_ID";
/// Env var carrying the 1-based attempt number to the agent.
pub const ITERATION_ENV: &str = "WAVEFRONT_ITERATION";
/// Env var listing changed files (newline separated) for the review command.
pub const CHANGED_FILES_ENV: &str = "WAVEFRONT_CHANGED_FILES";

/// Longest failure text kept for prompts and reports.
const MAX_FAILURE_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Implementation,
    Test,
    Review,
    Quality,
}

impl Gate {
    pub fn name(&self) -> &'static str {
        match self {
            Gate::Implementation => "implementation",
            Gate::Test => "test",
            Gate::Review => "review",
            Gate::Quality => "quality",
        }
    }

    /// Hard gates block completion.
    pub fn is_hard(&self) -> bool {
        !matches!(self, Gate::Quality)
    }
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Pass,
    Fail { gate: Gate, text: String },
    Cancelled,
}

impl GateVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateVerdict::Pass)
    }

    fn from_outcome(gate: Gate, outcome: &ProcessOutcome) -> Self {
        if outcome.is_cancelled() {
            GateVerdict::Cancelled
        } else if outcome.is_success() {
            GateVerdict::Pass
        } else {
            GateVerdict::Fail {
                gate,
                text: truncate_tail(&outcome.failure_text(), MAX_FAILURE_CHARS),
            }
        }
    }
}

/// Commands and budgets for the agent and every gate.
#[derive(Debug, Clone)]
pub struct Gates {
    agent_command: String,
    commands: GateConfig,
    timeouts: TimeoutConfig,
}

impl Gates {
    pub fn new(config: &Config) -> Self {
        Self {
            agent_command: config.agent.command.clone(),
            commands: config.gates.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    /// Run the coding agent with `prompt` on stdin.
    pub async fn implement(
        &self,
        task: &Task,
        worktree: &Path,
        prompt: &str,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<GateVerdict> {
        tracing::info!(task = %task.id, iteration, "running agent");
        let outcome = ShellCommand::new(&self.agent_command, worktree)
            .env(TASK_ID_ENV, task.id.to_string())
            .env(ITERATION_ENV, iteration.to_string())
            .stdin(prompt)
            .timeout(self.timeouts.implementation())
            .run(cancel)
            .await?;
        Ok(GateVerdict::from_outcome(Gate::Implementation, &outcome))
    }

    /// Run test, review and quality gates in order.
    ///
    /// `changed` lists the paths the attempt changed relative to the task's
    /// base commit.
    pub async fn check(
        &self,
        task: &Task,
        worktree: &Path,
        changed: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<GateVerdict> {
        if let Some(command) = &self.commands.test_command {
            let outcome = ShellCommand::new(command, worktree)
                .env(TASK_ID_ENV, task.id.to_string())
                .timeout(self.timeouts.test())
                .run(cancel)
                .await?;
            let verdict = GateVerdict::from_outcome(Gate::Test, &outcome);
            if !verdict.is_pass() {
                return Ok(verdict);
            }
        }

        let verdict = match &self.commands.review_command {
            Some(command) => {
                let files: Vec<String> = changed.iter().map(|p| p.display().to_string()).collect();
                let outcome = ShellCommand::new(command, worktree)
                    .env(TASK_ID_ENV, task.id.to_string())
                    .env(CHANGED_FILES_ENV, files.join("\n"))
                    .stdin(task_text(task))
                    .timeout(self.timeouts.review())
                    .run(cancel)
                    .await?;
                GateVerdict::from_outcome(Gate::Review, &outcome)
            }
            None => review_changes(task, changed),
        };
        if !verdict.is_pass() {
            return Ok(verdict);
        }

        if let Some(command) = &self.commands.lint_command {
            let outcome = ShellCommand::new(command, worktree)
                .env(TASK_ID_ENV, task.id.to_string())
                .timeout(self.timeouts.quality())
                .run(cancel)
                .await?;
            match GateVerdict::from_outcome(Gate::Quality, &outcome) {
                GateVerdict::Cancelled => return Ok(GateVerdict::Cancelled),
                GateVerdict::Fail { text, .. } => {
                    tracing::warn!(task = %task.id, output = %text, "quality gate failed");
                }
                GateVerdict::Pass => {}
            }
        }

        Ok(GateVerdict::Pass)
    }
}

fn task_text(task: &Task) -> String {
    if task.body.is_empty() {
        format!("{}\n", task.title)
    } else {
        format!("{}\n\n{}\n", task.title, task.body.trim_end_matches('\n'))
    }
}

/// Built-in review when no review command is configured.
///
/// The attempt must change something, and when the task declares files at
/// least one of them (or a path under a declared directory) must change.
pub fn review_changes(task: &Task, changed: &[PathBuf]) -> GateVerdict {
    if changed.is_empty() {
        return GateVerdict::Fail {
            gate: Gate::Review,
            text: "no files changed relative to the task's base commit".to_string(),
        };
    }
    if task.touched_files.is_empty() {
        return GateVerdict::Pass;
    }

    let touched = changed.iter().any(|path| {
        task.touched_files
            .iter()
            .any(|declared| path == declared || path.starts_with(declared))
    });
    if touched {
        GateVerdict::Pass
    } else {
        let declared: Vec<String> = task
            .touched_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let actual: Vec<String> = changed.iter().map(|p| p.display().to_string()).collect();
        GateVerdict::Fail {
            gate: Gate::Review,
            text: format!(
                "none of the declared files were changed\ndeclared: {}\nchanged: {}",
                declared.join(", "),
                actual.join(", ")
            ),
        }
    }
}
