//! The wave loop.
//!
//! Waves run strictly one after another. Each wave goes through three phases:
//! dispatch (workers run tasks concurrently up to the scheduler's bound),
//! merge (ascending-id squash merges plus one re-attempt for conflicts) and
//! summarize (the wave's results become the next wave's board).

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Task, TaskId, Wave};
use crate::git::GitOps;
use crate::orchestration::bus::{
    format_board, task_sender, wave_topic, BusMessage, MessageBus, BOARD, MERGE_RESULT,
    ORCHESTRATOR, TASK_RESULT,
};
use crate::orchestration::lease::RunLease;
use crate::orchestration::merge::{MergeOutcome, MergePipeline, MergeRequest};
use crate::orchestration::report::RunReport;
use crate::orchestration::scheduler::{Scheduler, SchedulerEvent};
use crate::orchestration::workspace::{TaskContext, TaskRunOutcome, WorkspaceManager, WorktreeHandle};
use crate::plan::Plan;
use crate::util::blocking;
use crate::{Error, Result};

/// Suffix of the branch used for the conflict re-attempt.
pub const REBASE_SUFFIX: &str = "-rebase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavePhase {
    Dispatching,
    Merging,
    Summarizing,
}

impl std::fmt::Display for WavePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WavePhase::Dispatching => "dispatching",
            WavePhase::Merging => "merging",
            WavePhase::Summarizing => "summarizing",
        })
    }
}

pub struct Orchestrator {
    git: GitOps,
    config: Config,
    scheduler: Scheduler,
    workspace: WorkspaceManager,
    merger: MergePipeline,
    bus: MessageBus,
    run_dir: PathBuf,
    quiet: bool,
}

impl Orchestrator {
    pub fn new(repo: &Path, plan: Plan, config: Config) -> Result<Self> {
        config.validate()?;
        let git = GitOps::new(repo)?;
        let run_dir = config.run_dir(repo)?;
        let worktree_root = config.worktree_dir(repo)?;
        tracing::info!(
            repo = %repo.display(),
            run_dir = %run_dir.display(),
            worktrees = %worktree_root.display(),
            "orchestrator ready"
        );

        Ok(Self {
            scheduler: Scheduler::new(plan, config.run.max_concurrent),
            workspace: WorkspaceManager::new(git.clone(), &config, &worktree_root),
            merger: MergePipeline::new(git.clone(), &config.run.integration_branch),
            bus: MessageBus::new(&run_dir),
            git,
            config,
            run_dir,
            quiet: false,
        })
    }

    /// Forward scheduler events to `tx`.
    pub fn with_events(mut self, tx: tokio::sync::mpsc::Sender<SchedulerEvent>) -> Self {
        self.scheduler = self.scheduler.with_events(tx);
        self
    }

    /// Suppress progress lines on stdout.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Execute every wave and report.
    ///
    /// Per-task failures end up in the report; only infrastructure errors
    /// (git, filesystem, lease) are returned as `Err`.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        self.check_agent()?;

        let git = self.git.clone();
        let run_dir = self.run_dir.clone();
        let lease = blocking(move || RunLease::acquire(&run_dir, &git)).await?;

        let run_cancel = cancel.child_token();
        let deadline = self.config.deadline().map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!(?limit, "run deadline reached, cancelling");
                token.cancel();
            })
        });

        let result = self.run_waves(&run_cancel).await;

        if let Some(timer) = deadline {
            timer.abort();
        }
        if let Err(e) = blocking(move || lease.release()).await {
            tracing::warn!(error = %e, "failed to release run lease");
        }
        result?;

        let timed_out = run_cancel.is_cancelled();
        if timed_out {
            let skipped = self.scheduler.skip_unfinished_due_to_timeout().await?;
            tracing::warn!(skipped = skipped.len(), "run cancelled, unfinished tasks skipped");
        }
        Ok(self.scheduler.report(started.elapsed(), timed_out).await)
    }

    fn check_agent(&self) -> Result<()> {
        let Some(program) = self.config.agent.command.split_whitespace().next() else {
            return Err(Error::AgentNotAvailable("agent command is empty".into()));
        };
        if program.contains('=') || program.contains('/') || is_shell_word(program) {
            return Ok(());
        }
        which::which(program)
            .map(|_| ())
            .map_err(|_| Error::AgentNotAvailable(format!("{} not found on PATH", program)))
    }

    async fn run_waves(&self, cancel: &CancellationToken) -> Result<()> {
        let git = self.git.clone();
        let branch = self.config.run.integration_branch.clone();
        blocking(move || git.ensure_branch(&branch)).await?;

        let waves = self.scheduler.waves().await;
        let bus = self.bus.clone();
        let topics = waves.len() + 1;
        blocking(move || {
            for k in 1..=topics {
                bus.remove_topic(&wave_topic(k))?;
            }
            Ok(())
        })
        .await?;

        for wave in &waves {
            if cancel.is_cancelled() {
                break;
            }
            self.progress(wave, waves.len(), WavePhase::Dispatching);
            self.scheduler.skip_blocked(wave).await?;
            let completed = self.dispatch_phase(wave, cancel).await?;

            if cancel.is_cancelled() {
                for handle in &completed {
                    self.release(handle).await;
                }
                break;
            }

            self.progress(wave, waves.len(), WavePhase::Merging);
            self.merge_phase(wave, completed, cancel).await?;

            self.progress(wave, waves.len(), WavePhase::Summarizing);
            if wave.index < waves.len() {
                self.summarize_phase(wave).await?;
            }
        }
        Ok(())
    }

    fn progress(&self, wave: &Wave, total: usize, phase: WavePhase) {
        tracing::info!(wave = wave.index, total, %phase, "wave progress");
        if !self.quiet {
            println!("Wave {}/{}: {}", wave.index, total, phase);
        }
    }

    /// Run every task of the wave; returns handles of the Done ones.
    async fn dispatch_phase(&self, wave: &Wave, cancel: &CancellationToken) -> Result<Vec<WorktreeHandle>> {
        let base = self.integration_tip().await?;
        let board = self.board_for(wave).await?;
        let topic = wave_topic(wave.index);

        let mut workers = JoinSet::new();
        let mut completed = Vec::new();
        loop {
            if !cancel.is_cancelled() {
                for task in self.scheduler.get_ready_tasks(wave).await {
                    let context = TaskContext {
                        branch: task.branch_name.clone(),
                        base_commit: base.clone(),
                        board: board.clone(),
                    };
                    self.spawn_worker(&mut workers, task, context, &topic, cancel).await?;
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (task, outcome) = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
            if let Some(handle) = self.record_outcome(&task, outcome).await? {
                completed.push(handle);
            }
        }
        Ok(completed)
    }

    async fn spawn_worker(
        &self,
        workers: &mut JoinSet<(Task, Result<TaskRunOutcome>)>,
        task: Task,
        context: TaskContext,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.scheduler.mark_running(task.id).await?;
        self.scheduler
            .set_worktree(task.id, Some(self.workspace.worktree_path(&context.branch)))
            .await?;

        let workspace = self.workspace.clone();
        let bus = self.bus.clone();
        let topic = topic.to_string();
        let token = cancel.clone();
        workers.spawn(async move {
            let outcome = workspace.run_task(&task, &context, &token).await;
            if let Some(text) = result_line(&task, &outcome) {
                let message = BusMessage::new(TASK_RESULT, &task_sender(task.id), &topic, text);
                let published = blocking(move || bus.publish(&topic, &message)).await;
                if let Err(e) = published {
                    tracing::warn!(task = %task.id, error = %e, "failed to publish task result");
                }
            }
            (task, outcome)
        });
        Ok(())
    }

    /// Apply a worker's outcome to the scheduler.
    async fn record_outcome(&self, task: &Task, outcome: Result<TaskRunOutcome>) -> Result<Option<WorktreeHandle>> {
        match outcome {
            Ok(TaskRunOutcome::Done(handle)) => {
                self.scheduler.mark_done(task.id).await?;
                Ok(Some(handle))
            }
            Ok(TaskRunOutcome::Failed {
                reason,
                preserved_branch,
            }) => {
                self.scheduler.mark_failed(task.id, &reason, preserved_branch).await?;
                Ok(None)
            }
            // Left Running; the run ends with SkippedDueToTimeout and the
            // worktree stays for a later restart.
            Ok(TaskRunOutcome::Cancelled) => Ok(None),
            Err(e) => {
                tracing::error!(task = %task.id, error = %e, "worker error");
                let preserved = match self.workspace.preserve(task.id, &task.branch_name).await {
                    Ok(branch) => branch,
                    Err(keep) => {
                        // Leave the worktree on disk rather than lose its files.
                        tracing::warn!(task = %task.id, error = %keep, "could not preserve work, worktree kept");
                        None
                    }
                };
                self.scheduler.mark_failed(task.id, &e.to_string(), preserved).await?;
                Ok(None)
            }
        }
    }

    /// Merge the wave's completed branches, then give conflicting tasks one
    /// more run on top of the updated integration branch.
    async fn merge_phase(&self, wave: &Wave, completed: Vec<WorktreeHandle>, cancel: &CancellationToken) -> Result<()> {
        let mut requests = Vec::with_capacity(completed.len());
        for handle in &completed {
            let title = self
                .scheduler
                .task(handle.task_id)
                .await
                .map(|t| t.title)
                .unwrap_or_default();
            requests.push(MergeRequest {
                task_id: handle.task_id,
                title,
                branch: handle.branch.clone(),
            });
        }

        let merger = self.merger.clone();
        let outcomes = blocking(move || Ok(merger.merge_in_order(requests))).await?;

        let mut conflicted = Vec::new();
        for (id, outcome) in outcomes {
            if outcome.is_conflict() {
                conflicted.push(id);
            }
            self.apply_merge(wave, id, outcome).await?;
            if let Some(handle) = completed.iter().find(|h| h.task_id == id) {
                self.release(handle).await;
            }
        }

        for id in conflicted {
            if cancel.is_cancelled() {
                break;
            }
            self.reattempt(wave, id, cancel).await?;
        }
        Ok(())
    }

    /// Re-run a conflicting task once on `<branch>-rebase` and merge it again.
    async fn reattempt(&self, wave: &Wave, id: TaskId, cancel: &CancellationToken) -> Result<()> {
        let Some(task) = self.scheduler.task(id).await else {
            return Err(Error::TaskNotFound(id));
        };
        let conflicts = match &task.status {
            crate::core::TaskStatus::MergeFailed { conflicts, .. } => conflicts.clone(),
            _ => return Ok(()),
        };

        let branch = format!("{}{}", id.branch_name(), REBASE_SUFFIX);
        tracing::info!(task = %id, branch = %branch, "re-running task after merge conflict");
        self.scheduler.mark_running(id).await?;
        self.scheduler.set_branch(id, &branch).await?;
        self.scheduler
            .set_worktree(id, Some(self.workspace.worktree_path(&branch)))
            .await?;

        let files: Vec<String> = conflicts.iter().map(|p| p.display().to_string()).collect();
        let mut board = self.board_for(wave).await?.unwrap_or_default();
        if !board.is_empty() {
            board.push_str("\n\n");
        }
        board.push_str(&format!(
            "An earlier attempt at this task conflicted with the integration branch on: {}. \
             Re-implement the task on top of the current code.",
            files.join(", ")
        ));
        let context = TaskContext {
            branch: branch.clone(),
            base_commit: self.integration_tip().await?,
            board: Some(board),
        };

        let mut task = task;
        task.branch_name = branch.clone();
        let outcome = self.workspace.run_task(&task, &context, cancel).await;
        let Some(handle) = self.record_outcome(&task, outcome).await? else {
            return Ok(());
        };

        let merger = self.merger.clone();
        let request = MergeRequest {
            task_id: id,
            title: task.title.clone(),
            branch,
        };
        let outcome = blocking(move || Ok(merger.try_squash_merge(&request))).await?;
        self.apply_merge(wave, id, outcome).await?;
        self.release(&handle).await;
        Ok(())
    }

    async fn apply_merge(&self, wave: &Wave, id: TaskId, outcome: MergeOutcome) -> Result<()> {
        let text = match outcome {
            MergeOutcome::Merged { commit } => {
                self.scheduler.mark_merged(id, &commit).await?;
                format!("task {} merged at {}", id, short(&commit))
            }
            MergeOutcome::UpToDate => {
                let tip = self.integration_tip().await?;
                self.scheduler.mark_merged(id, &tip).await?;
                format!("task {} already up to date", id)
            }
            MergeOutcome::Conflict { files } => {
                let names: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
                self.scheduler.mark_merge_failed(id, files).await?;
                format!("task {} conflicted on {}", id, names.join(", "))
            }
            MergeOutcome::Error { reason } => {
                self.scheduler.mark_merge_error(id, &reason).await?;
                format!("task {} could not be merged: {}", id, reason)
            }
        };
        self.publish(&wave_topic(wave.index), MERGE_RESULT, &text).await
    }

    /// Turn wave k's results into the board for wave k+1.
    async fn summarize_phase(&self, wave: &Wave) -> Result<()> {
        let bus = self.bus.clone();
        let topic = wave_topic(wave.index);
        let messages = blocking(move || bus.read(&topic, usize::MAX)).await?;
        let board = format_board(wave.index, &messages);
        self.publish(&wave_topic(wave.index + 1), BOARD, &board).await
    }

    /// Latest board published to this wave's topic.
    async fn board_for(&self, wave: &Wave) -> Result<Option<String>> {
        let bus = self.bus.clone();
        let topic = wave_topic(wave.index);
        let messages = blocking(move || bus.read(&topic, usize::MAX)).await?;
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.kind == BOARD)
            .map(BusMessage::payload_text))
    }

    async fn publish(&self, topic: &str, kind: &str, text: &str) -> Result<()> {
        let bus = self.bus.clone();
        let topic = topic.to_string();
        let message = BusMessage::new(kind, ORCHESTRATOR, &topic, text);
        blocking(move || bus.publish(&topic, &message).map(|_| ())).await
    }

    async fn integration_tip(&self) -> Result<String> {
        let git = self.git.clone();
        let branch = self.config.run.integration_branch.clone();
        blocking(move || git.ensure_branch(&branch)).await
    }

    async fn release(&self, handle: &WorktreeHandle) {
        if let Err(e) = self.workspace.release(handle).await {
            tracing::warn!(task = %handle.task_id, error = %e, "failed to release worktree");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("repo", &self.git.repo_path())
            .field("run_dir", &self.run_dir)
            .finish()
    }
}

fn result_line(task: &Task, outcome: &Result<TaskRunOutcome>) -> Option<String> {
    match outcome {
        Ok(TaskRunOutcome::Done(_)) => Some(format!("task {} done: {}", task.id, task.title)),
        Ok(TaskRunOutcome::Failed { reason, .. }) => Some(format!(
            "task {} failed: {}",
            task.id,
            reason.lines().next().unwrap_or_default()
        )),
        Ok(TaskRunOutcome::Cancelled) => None,
        Err(e) => Some(format!("task {} failed: {}", task.id, e)),
    }
}

fn short(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}

/// Shell keywords and builtins that can open an agent command line.
fn is_shell_word(word: &str) -> bool {
    matches!(
        word,
        "if" | "case" | "for" | "while" | "until" | "{" | "(" | "!" | "[" | "[["
            | "." | "cd" | "exec" | "export" | "set" | "eval" | "source" | "test"
            | "echo" | "printf" | "read" | "true" | "false" | "command"
    ) || word.starts_with('(')
        || word.starts_with('{')
}
