//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to coding agents. Each task
//! tracks its status, declared dependencies, file-touch hints, and the
//! branch and worktree its work lives on.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Prefix of the deterministic per-task branch.
pub const TASK_BRANCH_PREFIX: &str = "wavefront/task-";

/// Identifier of a task as declared in the plan.
///
/// Ids are positive integers. Their numeric order is the tie-break for
/// dispatch and merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Deterministic branch name for this task's work.
    pub fn branch_name(&self) -> String {
        format!("{}{}", TASK_BRANCH_PREFIX, self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Running -> {Done, Failed}` is the main path. A Done task whose
/// branch collides with the integration branch becomes `MergeFailed` and may
/// run exactly once more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task not yet dispatched.
    Pending,
    /// Task is being worked on in its worktree.
    Running,
    /// Task passed its hard gates.
    Done,
    /// Task exhausted its retry budget.
    Failed {
        /// Last failure reason.
        reason: String,
        /// Branch holding the partial work, if any was preserved.
        preserved_branch: Option<String>,
    },
    /// Task work succeeded but could not be merged.
    MergeFailed {
        /// Paths that conflicted with the integration branch.
        conflicts: Vec<PathBuf>,
        /// Branch holding the unmerged work.
        preserved_branch: String,
    },
    /// A dependency ended in a non-Done state.
    SkippedDueToDependencyFailure {
        /// The dependency that did not complete.
        dependency: TaskId,
    },
    /// The global deadline passed before the task finished.
    SkippedDueToTimeout,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Short label used in logs, reports and transition errors.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::MergeFailed { .. } => "merge_failed",
            TaskStatus::SkippedDueToDependencyFailure { .. } => "skipped_dependency_failure",
            TaskStatus::SkippedDueToTimeout => "skipped_timeout",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Done)
                | (Running, Failed { .. })
                | (Done, MergeFailed { .. })
                | (Done, Failed { .. })
                | (MergeFailed { .. }, Running)
                | (Pending, SkippedDueToDependencyFailure { .. })
                | (Pending, SkippedDueToTimeout)
                | (Running, SkippedDueToTimeout)
        )
    }

    /// Branch where unmerged or partial work was preserved.
    pub fn preserved_branch(&self) -> Option<&str> {
        match self {
            TaskStatus::Failed {
                preserved_branch, ..
            } => preserved_branch.as_deref(),
            TaskStatus::MergeFailed {
                preserved_branch, ..
            } => Some(preserved_branch),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason, .. } => write!(f, "failed: {}", reason),
            TaskStatus::MergeFailed { conflicts, .. } => {
                write!(f, "merge_failed: {} conflicting file(s)", conflicts.len())
            }
            TaskStatus::SkippedDueToDependencyFailure { dependency } => {
                write!(f, "skipped: dependency {} did not complete", dependency)
            }
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Plan-declared identifier.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Free-text instructions handed to the coding agent.
    pub body: String,
    /// Tasks that must be Done before this one starts (declared plus inferred).
    pub dependencies: BTreeSet<TaskId>,
    /// Paths the plan says this task will modify.
    pub touched_files: BTreeSet<PathBuf>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Branch the task's work is committed to.
    pub branch_name: String,
    /// Worktree of the in-flight attempt.
    pub worktree_path: Option<PathBuf>,
    /// Integration commit produced by the squash merge.
    pub merge_commit: Option<String>,
    /// Number of merge attempts made for this task.
    pub merge_attempts: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies or file hints.
    pub fn new(id: TaskId, title: &str, body: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            body: body.to_string(),
            dependencies: BTreeSet::new(),
            touched_files: BTreeSet::new(),
            status: TaskStatus::Pending,
            branch_name: id.branch_name(),
            worktree_path: None,
            merge_commit: None,
            merge_attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder-style helper to declare dependencies.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Builder-style helper to declare touched files.
    pub fn with_files<P: Into<PathBuf>>(mut self, files: impl IntoIterator<Item = P>) -> Self {
        self.touched_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Apply a status transition, rejecting illegal moves.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                task: self.id,
                from: self.status.label().to_string(),
                to: next.label().to_string(),
            });
        }
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Pending => {}
            _ => self.completed_at = Some(Utc::now()),
        }
        self.status = next;
        Ok(())
    }

    /// Check if the task is Done.
    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }

    /// Check if the task can be dispatched.
    pub fn can_start(&self) -> bool {
        self.status.can_transition_to(&TaskStatus::Running)
    }

    /// Done and squash-merged into the integration branch.
    pub fn is_merged(&self) -> bool {
        self.is_done() && self.merge_commit.is_some()
    }
}
