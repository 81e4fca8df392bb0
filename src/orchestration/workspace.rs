//! Per-task execution: worktree, agent attempts, gates and the Ralph Loop.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RalphConfig};
use crate::core::{Task, TaskId};
use crate::git::GitOps;
use crate::orchestration::gates::{Gate, GateVerdict, Gates};
use crate::orchestration::ralph::{RalphState, STRATEGY_SHIFT_DIRECTIVE};
use crate::util::{blocking, timestamp_slug, truncate_tail};
use crate::{Error, Result};

/// Prefix of branches preserving a failed task's partial work.
pub const FAILED_BRANCH_PREFIX: &str = "wip/fail-";

const SUMMARY_CHARS: usize = 1500;
const PROMPT_FAILURES: usize = 3;

/// A task's worktree for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub base_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Done(WorktreeHandle),
    Failed {
        reason: String,
        preserved_branch: Option<String>,
    },
    Cancelled,
}

/// What a worker needs besides the task itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Branch the attempt commits to.
    pub branch: String,
    /// Integration tip new branches start from.
    pub base_commit: String,
    /// Summary of earlier waves.
    pub board: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: GitOps,
    gates: Gates,
    ralph: RalphConfig,
    worktree_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(git: GitOps, config: &Config, worktree_root: &Path) -> Self {
        Self {
            git,
            gates: Gates::new(config),
            ralph: config.ralph.clone(),
            worktree_root: worktree_root.to_path_buf(),
        }
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// `<worktree_root>/task-<id>`, or `task-<id>-rebase` for the re-attempt branch.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        let name = branch.rsplit('/').next().unwrap_or(branch);
        self.worktree_root.join(name)
    }

    /// Run `task` until its gates pass, the iteration cap is hit, or `cancel` fires.
    pub async fn run_task(
        &self,
        task: &Task,
        context: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<TaskRunOutcome> {
        let handle = self.acquire(task.id, context).await?;
        let root = self.worktree_root.clone();
        let id = task.id;
        let mut state = blocking(move || RalphState::load(&root, id)).await?;

        loop {
            if cancel.is_cancelled() {
                self.save_state(&state).await?;
                return Ok(TaskRunOutcome::Cancelled);
            }

            let shift = state.take_strategy_shift();
            let iteration = state.iteration + 1;
            let prompt = build_prompt(task, context, &state, shift);
            let implemented = self
                .gates
                .implement(task, &handle.path, &prompt, iteration, cancel)
                .await
                .unwrap_or_else(|e| attempt_error(Gate::Implementation, e));

            if implemented == GateVerdict::Cancelled {
                state.strategy_shift_pending = shift;
                self.save_state(&state).await?;
                return Ok(TaskRunOutcome::Cancelled);
            }

            let git = self.git.clone();
            let path = handle.path.clone();
            let message = format!("task {}: {} (attempt {})", task.id, task.title, iteration);
            let committed = blocking(move || git.commit_all(&path, &message)).await;

            let verdict = match (implemented, committed) {
                (GateVerdict::Pass, Ok(_)) => match self.changed_files(&handle).await {
                    Ok(changed) => self
                        .gates
                        .check(task, &handle.path, &changed, cancel)
                        .await
                        .unwrap_or_else(|e| attempt_error(Gate::Test, e)),
                    Err(e) => attempt_error(Gate::Review, e),
                },
                (GateVerdict::Pass, Err(e)) => attempt_error(Gate::Implementation, e),
                (other, _) => other,
            };

            match verdict {
                GateVerdict::Pass => {
                    let root = self.worktree_root.clone();
                    blocking(move || RalphState::delete(&root, id)).await?;
                    tracing::info!(task = %task.id, iteration, "gates passed");
                    return Ok(TaskRunOutcome::Done(handle));
                }
                GateVerdict::Cancelled => {
                    self.save_state(&state).await?;
                    return Ok(TaskRunOutcome::Cancelled);
                }
                GateVerdict::Fail { gate, text } => {
                    tracing::warn!(task = %task.id, iteration, gate = %gate, "attempt failed");
                    state.record_failure(
                        gate.name(),
                        &text,
                        truncate_tail(&text, SUMMARY_CHARS),
                        self.ralph.stuck_threshold,
                    );
                    self.save_state(&state).await?;

                    if state.cap_reached(self.ralph.max_iterations) {
                        let reason = format!(
                            "{} gate failed after {} iteration(s)\n{}",
                            gate,
                            state.iteration,
                            truncate_tail(&text, SUMMARY_CHARS)
                        );
                        return self.fail(&handle, reason).await;
                    }
                }
            }
        }
    }

    /// Remove the worktree directory; the branch stays.
    pub async fn release(&self, handle: &WorktreeHandle) -> Result<()> {
        let git = self.git.clone();
        let path = handle.path.clone();
        blocking(move || git.remove_worktree(&path)).await
    }

    /// Create or reuse the task's worktree on `context.branch`.
    async fn acquire(&self, task_id: TaskId, context: &TaskContext) -> Result<WorktreeHandle> {
        let git = self.git.clone();
        let path = self.worktree_path(&context.branch);
        let branch = context.branch.clone();
        let base = context.base_commit.clone();
        let root = self.worktree_root.clone();

        blocking(move || {
            std::fs::create_dir_all(&root)?;
            if !git.is_worktree(&path) {
                // Leftover directory or admin entry from an interrupted run
                git.remove_worktree(&path)?;
                if git.branch_exists(&branch)? {
                    tracing::info!(task = %task_id, branch = %branch, "resuming existing branch");
                    git.create_worktree_from_branch(&branch, &path)?;
                } else {
                    git.create_worktree(&branch, &path, &base)?;
                }
            } else {
                tracing::info!(task = %task_id, path = %path.display(), "reusing worktree");
            }

            let head = git.worktree_head(&path)?;
            let base_commit = git.merge_base(&base, &head)?;
            Ok(WorktreeHandle {
                task_id,
                path,
                branch,
                base_commit,
            })
        })
        .await
    }

    async fn changed_files(&self, handle: &WorktreeHandle) -> Result<Vec<PathBuf>> {
        let git = self.git.clone();
        let path = handle.path.clone();
        let base = handle.base_commit.clone();
        blocking(move || {
            let head = git.worktree_head(&path)?;
            git.changed_files(&base, &head)
        })
        .await
    }

    async fn save_state(&self, state: &RalphState) -> Result<()> {
        let root = self.worktree_root.clone();
        let state = state.clone();
        blocking(move || state.save(&root)).await
    }

    /// Preserve partial work on a `wip/fail-*` branch and clean up.
    async fn fail(&self, handle: &WorktreeHandle, reason: String) -> Result<TaskRunOutcome> {
        let preserved = self.preserve(handle.task_id, &handle.branch).await?;
        Ok(TaskRunOutcome::Failed {
            reason,
            preserved_branch: preserved,
        })
    }

    /// Commit whatever is left in the task's worktree to a new
    /// `wip/fail-<id>-<timestamp>` branch, then drop the worktree and the
    /// Ralph state. Returns `None` when no worktree exists.
    pub async fn preserve(&self, task_id: TaskId, branch: &str) -> Result<Option<String>> {
        let git = self.git.clone();
        let path = self.worktree_path(branch);
        let root = self.worktree_root.clone();

        let preserved = blocking(move || {
            if !git.is_worktree(&path) {
                git.remove_worktree(&path)?;
                return Ok(None);
            }

            let message = format!("task {}: partial work", task_id);
            if let Err(e) = git.commit_all(&path, &message) {
                tracing::warn!(task = %task_id, error = %e, "commit failed, taking a file snapshot");
                git.commit_snapshot(&path, &message)?;
            }
            let head = git.worktree_head(&path)?;
            let stamp = timestamp_slug(Utc::now());
            let mut name = format!("{}{}-{}", FAILED_BRANCH_PREFIX, task_id, stamp);
            let mut suffix = 1;
            while git.branch_exists(&name)? {
                suffix += 1;
                name = format!("{}{}-{}-{}", FAILED_BRANCH_PREFIX, task_id, stamp, suffix);
            }
            git.create_branch_at(&name, &head)?;
            RalphState::delete(&root, task_id)?;
            git.remove_worktree(&path)?;
            Ok(Some(name))
        })
        .await?;

        if let Some(branch) = &preserved {
            tracing::warn!(task = %task_id, branch = %branch, "task failed, partial work preserved");
        }
        Ok(preserved)
    }
}

/// An attempt that errored before its gates could decide counts as a failure
/// of `gate`, so it goes through the Ralph Loop like any other.
fn attempt_error(gate: Gate, error: Error) -> GateVerdict {
    tracing::warn!(gate = %gate, error = %error, "attempt error");
    GateVerdict::Fail {
        gate,
        text: error.to_string(),
    }
}

/// Prompt for one attempt. Every attempt gets a fresh agent process, so the
/// prompt carries everything it needs to know.
pub fn build_prompt(task: &Task, context: &TaskContext, state: &RalphState, strategy_shift: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task {}: {}", task.id, task.title);
    if !task.body.is_empty() {
        let _ = writeln!(out, "\n{}", task.body);
    }

    if !task.touched_files.is_empty() {
        let _ = writeln!(out, "\n## Files");
        for file in &task.touched_files {
            let _ = writeln!(out, "- {}", file.display());
        }
    }

    if let Some(board) = context.board.as_deref().filter(|b| !b.trim().is_empty()) {
        let _ = writeln!(out, "\n## Context from earlier waves\n{}", board.trim());
    }

    let failures = state.recent_failures(PROMPT_FAILURES);
    if !failures.is_empty() {
        let _ = writeln!(out, "\n## Previous attempts");
        for record in failures {
            let _ = writeln!(
                out,
                "Attempt {} failed at the {} gate:\n{}\n",
                record.iteration,
                record.gate,
                record.summary.trim()
            );
        }
    }

    if strategy_shift {
        let _ = writeln!(
            out,
            "\n## Strategy\nThe last attempts failed the same way. Do not repeat them: {}.",
            STRATEGY_SHIFT_DIRECTIVE
        );
    }

    let _ = writeln!(
        out,
        "\nWork only inside this repository checkout. Changes are committed automatically."
    );
    out
}
