//! Final run report.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId, TaskStatus, Wave};

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub title: String,
    /// 1-based wave the task belonged to.
    pub wave: usize,
    pub status: TaskStatus,
    pub branch: String,
    pub merged: bool,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Every task, ascending by id.
    pub tasks: Vec<TaskReport>,
    pub waves: usize,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl RunReport {
    pub fn new<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        waves: &[Wave],
        elapsed: Duration,
        timed_out: bool,
    ) -> Self {
        let wave_of: HashMap<TaskId, usize> = waves
            .iter()
            .flat_map(|w| w.tasks.iter().map(move |id| (*id, w.index)))
            .collect();

        let mut tasks: Vec<TaskReport> = tasks
            .into_iter()
            .map(|task| TaskReport {
                id: task.id,
                title: task.title.clone(),
                wave: wave_of.get(&task.id).copied().unwrap_or(0),
                status: task.status.clone(),
                branch: task
                    .status
                    .preserved_branch()
                    .map(str::to_string)
                    .unwrap_or_else(|| task.branch_name.clone()),
                merged: task.is_merged(),
            })
            .collect();
        tasks.sort_by_key(|t| t.id);

        Self {
            tasks,
            waves: waves.len(),
            elapsed,
            timed_out,
        }
    }

    /// Every task is Done and merged.
    pub fn is_success(&self) -> bool {
        !self.timed_out
            && self
                .tasks
                .iter()
                .all(|t| t.status == TaskStatus::Done && t.merged)
    }

    pub fn count(&self, label: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status.label() == label)
            .count()
    }

    /// Plain-text summary table.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title_width = self
            .tasks
            .iter()
            .map(|t| t.title.chars().count())
            .max()
            .unwrap_or(5)
            .clamp(5, 40);

        let _ = writeln!(
            out,
            "{:>4}  {:>4}  {:<title_width$}  {:<26}  {}",
            "ID", "WAVE", "TITLE", "STATUS", "BRANCH"
        );
        for task in &self.tasks {
            let title: String = task.title.chars().take(title_width).collect();
            let status = match &task.status {
                TaskStatus::Done if task.merged => "done (merged)".to_string(),
                other => other.label().to_string(),
            };
            let _ = writeln!(
                out,
                "{:>4}  {:>4}  {:<title_width$}  {:<26}  {}",
                task.id, task.wave, title, status, task.branch
            );
            match &task.status {
                TaskStatus::Failed { reason, .. } => {
                    let _ = writeln!(out, "      reason: {}", first_line(reason));
                }
                TaskStatus::MergeFailed { conflicts, .. } => {
                    let files: Vec<String> =
                        conflicts.iter().map(|p| p.display().to_string()).collect();
                    let _ = writeln!(out, "      conflicts: {}", files.join(", "));
                }
                TaskStatus::SkippedDueToDependencyFailure { dependency } => {
                    let _ = writeln!(out, "      blocked by task {}", dependency);
                }
                _ => {}
            }
        }

        let merged = self.tasks.iter().filter(|t| t.merged).count();
        let _ = writeln!(
            out,
            "\n{}/{} task(s) merged across {} wave(s) in {:.1}s{}",
            merged,
            self.tasks.len(),
            self.waves,
            self.elapsed.as_secs_f64(),
            if self.timed_out {
                " (deadline exceeded)"
            } else {
                ""
            }
        );
        out
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
