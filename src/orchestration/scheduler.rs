//! Scheduler for wave-based parallel task execution.
//!
//! The Scheduler is the single point of truth for task status. All mutators
//! go through one async mutex, so concurrent workers (one per in-flight task)
//! can report progress without racing each other. It also enforces the
//! concurrency bound: a task cannot be marked running once `max_concurrent`
//! tasks already are.

use crate::core::{Task, TaskId, TaskStatus, Wave};
use crate::error::{Error, Result};
use crate::orchestration::report::RunReport;
use crate::plan::Plan;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These events allow external components (progress output, tests) to react
/// to task state changes without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task was dispatched to a worker.
    TaskStarted { task_id: TaskId },
    /// A task passed its hard gates.
    TaskCompleted { task_id: TaskId },
    /// A task exhausted its retries.
    TaskFailed { task_id: TaskId, reason: String },
    /// A task's branch was squash-merged.
    TaskMerged { task_id: TaskId, commit: String },
    /// A task's branch conflicted with the integration branch.
    TaskMergeFailed { task_id: TaskId, conflicts: usize },
    /// A task will never run.
    TaskSkipped { task_id: TaskId, reason: String },
}

/// Bookkeeping for one run.
#[derive(Debug)]
struct ScheduleState {
    tasks: BTreeMap<TaskId, Task>,
    waves: Vec<Wave>,
    running_count: usize,
    max_concurrent: usize,
}

impl ScheduleState {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))
    }

    fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task
                .dependencies
                .iter()
                .all(|dep| self.tasks.get(dep).is_some_and(Task::is_done))
    }

    /// First dependency (ascending) that is not Done.
    fn blocking_dependency(&self, task: &Task) -> Option<TaskId> {
        task.dependencies
            .iter()
            .find(|dep| !self.tasks.get(*dep).is_some_and(Task::is_done))
            .copied()
    }
}

/// Shared scheduler handle; clones refer to the same state.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<ScheduleState>>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Scheduler {
    /// Create a scheduler for a planned run.
    pub fn new(plan: Plan, max_concurrent: usize) -> Self {
        let tasks = plan.tasks.into_iter().map(|t| (t.id, t)).collect();
        Self {
            state: Arc::new(Mutex::new(ScheduleState {
                tasks,
                waves: plan.waves,
                running_count: 0,
                max_concurrent: max_concurrent.max(1),
            })),
            event_tx: None,
        }
    }

    /// Emit lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn waves(&self) -> Vec<Wave> {
        self.state.lock().await.waves.clone()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running_count
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    /// All tasks, ascending by id.
    pub async fn snapshot(&self) -> Vec<Task> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    /// Pending tasks of `wave` whose dependencies are all Done, ascending by
    /// id, truncated to the free capacity.
    pub async fn get_ready_tasks(&self, wave: &Wave) -> Vec<Task> {
        let state = self.state.lock().await;
        let free = state.max_concurrent.saturating_sub(state.running_count);
        wave.tasks
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| state.is_ready(task))
            .take(free)
            .cloned()
            .collect()
    }

    /// Dispatch a task (or re-run a MergeFailed task once).
    ///
    /// # Errors
    /// `CapacityExhausted` when `max_concurrent` tasks are running,
    /// `InvalidTransition` when the task cannot start, `Validation` when a
    /// dependency is not Done.
    pub async fn mark_running(&self, id: TaskId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.running_count >= state.max_concurrent {
                return Err(Error::CapacityExhausted {
                    max: state.max_concurrent,
                });
            }

            let task = state.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
            if let Some(dep) = state.blocking_dependency(task) {
                return Err(Error::Validation(format!(
                    "task {} cannot start before dependency {} is done",
                    id, dep
                )));
            }
            if matches!(task.status, TaskStatus::MergeFailed { .. }) && task.merge_attempts > 1 {
                return Err(Error::InvalidTransition {
                    task: id,
                    from: task.status.label().to_string(),
                    to: TaskStatus::Running.label().to_string(),
                });
            }

            state.task_mut(id)?.transition(TaskStatus::Running)?;
            state.running_count += 1;
            tracing::debug!(task = %id, running = state.running_count, "task running");
        }
        self.emit(SchedulerEvent::TaskStarted { task_id: id }).await;
        Ok(())
    }

    /// Record the worktree of the in-flight attempt.
    pub async fn set_worktree(&self, id: TaskId, path: Option<PathBuf>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.task_mut(id)?.worktree_path = path;
        Ok(())
    }

    /// Point the task at a new branch (used by the conflict re-attempt).
    pub async fn set_branch(&self, id: TaskId, branch: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.task_mut(id)?.branch_name = branch.to_string();
        Ok(())
    }

    pub async fn mark_done(&self, id: TaskId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.task_mut(id)?.transition(TaskStatus::Done)?;
            state.running_count = state.running_count.saturating_sub(1);
        }
        tracing::info!(task = %id, "task done");
        self.emit(SchedulerEvent::TaskCompleted { task_id: id }).await;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        id: TaskId,
        reason: &str,
        preserved_branch: Option<String>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let task = state.task_mut(id)?;
            task.transition(TaskStatus::Failed {
                reason: reason.to_string(),
                preserved_branch,
            })?;
            task.worktree_path = None;
            state.running_count = state.running_count.saturating_sub(1);
        }
        tracing::warn!(task = %id, reason, "task failed");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: id,
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    /// Record a squash-merge conflict. Counts as one merge attempt.
    pub async fn mark_merge_failed(&self, id: TaskId, conflicts: Vec<PathBuf>) -> Result<()> {
        let count = conflicts.len();
        {
            let mut state = self.state.lock().await;
            let task = state.task_mut(id)?;
            let preserved_branch = task.branch_name.clone();
            task.transition(TaskStatus::MergeFailed {
                conflicts,
                preserved_branch,
            })?;
            task.merge_attempts += 1;
        }
        tracing::warn!(task = %id, conflicts = count, "merge conflict");
        self.emit(SchedulerEvent::TaskMergeFailed {
            task_id: id,
            conflicts: count,
        })
        .await;
        Ok(())
    }

    /// Fail a Done task whose squash merge could not be carried out.
    ///
    /// The task branch is kept and reported as the preserved branch.
    pub async fn mark_merge_error(&self, id: TaskId, reason: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let task = state.task_mut(id)?;
            let preserved_branch = Some(task.branch_name.clone());
            task.transition(TaskStatus::Failed {
                reason: format!("merge failed: {}", reason),
                preserved_branch,
            })?;
            task.merge_attempts += 1;
            task.worktree_path = None;
        }
        tracing::warn!(task = %id, reason, "merge error");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: id,
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    /// Record a successful squash merge of a Done task.
    pub async fn mark_merged(&self, id: TaskId, commit: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::Done {
                return Err(Error::InvalidTransition {
                    task: id,
                    from: task.status.label().to_string(),
                    to: "merged".to_string(),
                });
            }
            task.merge_commit = Some(commit.to_string());
            task.merge_attempts += 1;
            task.worktree_path = None;
        }
        self.emit(SchedulerEvent::TaskMerged {
            task_id: id,
            commit: commit.to_string(),
        })
        .await;
        Ok(())
    }

    /// Skip Pending tasks of `wave` whose dependencies did not end Done.
    ///
    /// Returns the skipped ids. These tasks are never retried.
    pub async fn skip_blocked(&self, wave: &Wave) -> Result<Vec<TaskId>> {
        let mut skipped = Vec::new();
        {
            let mut state = self.state.lock().await;
            for id in &wave.tasks {
                let Some(task) = state.tasks.get(id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }
                if let Some(dependency) = state.blocking_dependency(task) {
                    state
                        .task_mut(*id)?
                        .transition(TaskStatus::SkippedDueToDependencyFailure { dependency })?;
                    skipped.push((*id, dependency));
                }
            }
        }

        for (id, dependency) in &skipped {
            tracing::warn!(task = %id, dependency = %dependency, "skipping task, dependency did not complete");
            self.emit(SchedulerEvent::TaskSkipped {
                task_id: *id,
                reason: format!("dependency {} did not complete", dependency),
            })
            .await;
        }
        Ok(skipped.into_iter().map(|(id, _)| id).collect())
    }

    /// Mark every Pending or Running task `SkippedDueToTimeout`.
    pub async fn skip_unfinished_due_to_timeout(&self) -> Result<Vec<TaskId>> {
        let mut skipped = Vec::new();
        {
            let mut state = self.state.lock().await;
            let ids: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
                .map(|t| t.id)
                .collect();
            for id in ids {
                let task = state.task_mut(id)?;
                let was_running = task.status == TaskStatus::Running;
                task.transition(TaskStatus::SkippedDueToTimeout)?;
                task.worktree_path = None;
                if was_running {
                    state.running_count = state.running_count.saturating_sub(1);
                }
                skipped.push(id);
            }
        }

        for id in &skipped {
            self.emit(SchedulerEvent::TaskSkipped {
                task_id: *id,
                reason: "deadline exceeded".to_string(),
            })
            .await;
        }
        Ok(skipped)
    }

    /// Build the final report.
    pub async fn report(&self, elapsed: Duration, timed_out: bool) -> RunReport {
        let state = self.state.lock().await;
        RunReport::new(state.tasks.values(), &state.waves, elapsed, timed_out)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("events", &self.event_tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanFormat;

    const DIAMOND: &str = "\
## Task 1: root
## Task 2: left
depends: [1]
## Task 3: right
depends: [1]
## Task 4: join
depends: [2, 3]
";

    fn scheduler(text: &str, max: usize) -> Scheduler {
        Scheduler::new(Plan::from_str(text, PlanFormat::Markdown).unwrap(), max)
    }

    fn ids(tasks: &[Task]) -> Vec<u32> {
        tasks.iter().map(|t| t.id.0).collect()
    }

    #[tokio::test]
    async fn test_ready_tasks_ascending_and_capped() {
        let s = scheduler(
            "## Task 4: d\n## Task 2: b\n## Task 3: c\n## Task 1: a\n",
            2,
        );
        let wave = s.waves().await[0].clone();
        assert_eq!(ids(&s.get_ready_tasks(&wave).await), vec![1, 2]);

        s.mark_running(TaskId(1)).await.unwrap();
        assert_eq!(ids(&s.get_ready_tasks(&wave).await), vec![2]);

        s.mark_running(TaskId(2)).await.unwrap();
        assert!(s.get_ready_tasks(&wave).await.is_empty());
        assert_eq!(s.running_count().await, 2);
    }

    #[tokio::test]
    async fn test_mark_running_respects_capacity() {
        let s = scheduler("## Task 1: a\n## Task 2: b\n", 1);
        s.mark_running(TaskId(1)).await.unwrap();
        let err = s.mark_running(TaskId(2)).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted { max: 1 }));

        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_running(TaskId(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_never_ready_before_dependencies_done() {
        let s = scheduler(DIAMOND, 4);
        let waves = s.waves().await;
        assert_eq!(waves.len(), 3);

        assert!(s.get_ready_tasks(&waves[1]).await.is_empty());
        let err = s.mark_running(TaskId(2)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        s.mark_running(TaskId(1)).await.unwrap();
        assert!(s.get_ready_tasks(&waves[1]).await.is_empty());
        s.mark_done(TaskId(1)).await.unwrap();
        assert_eq!(ids(&s.get_ready_tasks(&waves[1]).await), vec![2, 3]);

        s.mark_running(TaskId(2)).await.unwrap();
        s.mark_done(TaskId(2)).await.unwrap();
        assert!(s.get_ready_tasks(&waves[2]).await.is_empty());
    }

    #[tokio::test]
    async fn test_running_twice_rejected() {
        let s = scheduler("## Task 1: a\n", 3);
        s.mark_running(TaskId(1)).await.unwrap();
        let err = s.mark_running(TaskId(1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(s.running_count().await, 1);
    }

    #[tokio::test]
    async fn test_skip_blocked_after_failure() {
        let s = scheduler(DIAMOND, 4);
        let waves = s.waves().await;

        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_failed(TaskId(1), "boom", Some("wip/fail-1-x".into()))
            .await
            .unwrap();

        let skipped = s.skip_blocked(&waves[1]).await.unwrap();
        assert_eq!(skipped, vec![TaskId(2), TaskId(3)]);
        let skipped = s.skip_blocked(&waves[2]).await.unwrap();
        assert_eq!(skipped, vec![TaskId(4)]);

        let task = s.task(TaskId(4)).await.unwrap();
        assert_eq!(
            task.status,
            TaskStatus::SkippedDueToDependencyFailure {
                dependency: TaskId(2)
            }
        );
        assert!(s.get_ready_tasks(&waves[2]).await.is_empty());
    }

    #[tokio::test]
    async fn test_merge_failed_reattempt_only_once() {
        let s = scheduler("## Task 1: a\n", 3);
        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_merge_failed(TaskId(1), vec![PathBuf::from("a.rs")])
            .await
            .unwrap();

        let task = s.task(TaskId(1)).await.unwrap();
        assert_eq!(task.status.preserved_branch(), Some("wavefront/task-1"));

        s.set_branch(TaskId(1), "wavefront/task-1-rebase").await.unwrap();
        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_merge_failed(TaskId(1), vec![PathBuf::from("a.rs")])
            .await
            .unwrap();

        let err = s.mark_running(TaskId(1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let task = s.task(TaskId(1)).await.unwrap();
        assert_eq!(task.status.preserved_branch(), Some("wavefront/task-1-rebase"));
    }

    #[tokio::test]
    async fn test_mark_merged_requires_done() {
        let s = scheduler("## Task 1: a\n", 3);
        assert!(s.mark_merged(TaskId(1), "abc").await.is_err());

        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_merged(TaskId(1), "abc").await.unwrap();

        let report = s.report(Duration::from_secs(1), false).await;
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_merge_error_fails_done_task_and_blocks_dependents() {
        let s = scheduler("## Task 1: a\n## Task 2: b\ndepends: [1]\n", 3);
        let waves = s.waves().await;
        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_merge_error(TaskId(1), "reference not found").await.unwrap();

        let task = s.task(TaskId(1)).await.unwrap();
        assert_eq!(
            task.status,
            TaskStatus::Failed {
                reason: "merge failed: reference not found".into(),
                preserved_branch: Some("wavefront/task-1".into()),
            }
        );
        assert_eq!(s.running_count().await, 0);
        assert_eq!(s.skip_blocked(&waves[1]).await.unwrap(), vec![TaskId(2)]);
    }

    #[tokio::test]
    async fn test_timeout_skips_pending_and_running() {
        let s = scheduler("## Task 1: a\n## Task 2: b\n## Task 3: c\n", 3);
        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_running(TaskId(2)).await.unwrap();

        let skipped = s.skip_unfinished_due_to_timeout().await.unwrap();
        assert_eq!(skipped, vec![TaskId(2), TaskId(3)]);
        assert_eq!(s.running_count().await, 0);
        assert_eq!(
            s.task(TaskId(1)).await.unwrap().status,
            TaskStatus::Done
        );

        let report = s.report(Duration::from_secs(1), true).await;
        assert!(!report.is_success());
        assert_eq!(report.count("skipped_timeout"), 2);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let s = scheduler("## Task 1: a\n", 3).with_events(tx);

        s.mark_running(TaskId(1)).await.unwrap();
        s.mark_done(TaskId(1)).await.unwrap();
        s.mark_merged(TaskId(1), "c0ffee").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SchedulerEvent::TaskStarted { task_id: TaskId(1) })
        );
        assert_eq!(
            rx.recv().await,
            Some(SchedulerEvent::TaskCompleted { task_id: TaskId(1) })
        );
        assert_eq!(
            rx.recv().await,
            Some(SchedulerEvent::TaskMerged {
                task_id: TaskId(1),
                commit: "c0ffee".into()
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_workers_share_state() {
        let s = scheduler(
            "## Task 1: a\n## Task 2: b\n## Task 3: c\n## Task 4: d\n",
            4,
        );
        let wave = s.waves().await[0].clone();
        let ready = s.get_ready_tasks(&wave).await;

        let mut handles = Vec::new();
        for task in ready {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.mark_running(task.id).await.unwrap();
                tokio::task::yield_now().await;
                s.mark_done(task.id).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(s.running_count().await, 0);
        assert!(s.snapshot().await.iter().all(Task::is_done));
    }
}
