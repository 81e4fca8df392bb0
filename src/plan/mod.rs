//! Plan loading: parse a plan document, infer file-overlap dependencies and
//! layer the result into waves.

pub mod parser;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::core::{Task, TaskDAG, TaskId, Wave};
use crate::Result;

pub use parser::{parse_file, parse_str, PlanFormat};

/// A validated plan ready for execution.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Tasks in declaration order, dependencies including inferred ones.
    pub tasks: Vec<Task>,
    pub waves: Vec<Wave>,
}

impl Plan {
    /// Parse and plan a file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading plan");
        Self::from_tasks(parse_file(path)?)
    }

    pub fn from_str(text: &str, format: PlanFormat) -> Result<Self> {
        Self::from_tasks(parse_str(text, format)?)
    }

    /// Build the DAG, add overlap edges and compute waves.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = TaskDAG::from_tasks(tasks)?;
        let inferred = dag.infer_file_overlaps()?;
        let waves = dag.compute_waves()?;
        tracing::info!(
            tasks = dag.task_count(),
            inferred,
            waves = waves.len(),
            "plan ready"
        );
        Ok(Self {
            tasks: dag.into_tasks(),
            waves,
        })
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// 1-based wave index of every task.
    pub fn wave_index(&self) -> BTreeMap<TaskId, usize> {
        self.waves
            .iter()
            .flat_map(|w| w.tasks.iter().map(move |id| (*id, w.index)))
            .collect()
    }

    /// Human-readable wave layout, as printed by `--dry-run`.
    pub fn render_layout(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} task(s) in {} wave(s)",
            self.tasks.len(),
            self.waves.len()
        );
        for wave in &self.waves {
            let _ = writeln!(out, "Wave {}/{}:", wave.index, self.waves.len());
            for id in &wave.tasks {
                let Some(task) = self.task(*id) else {
                    continue;
                };
                let deps = if task.dependencies.is_empty() {
                    String::new()
                } else {
                    let list: Vec<String> =
                        task.dependencies.iter().map(|d| d.to_string()).collect();
                    format!(" (after {})", list.join(", "))
                };
                let _ = writeln!(out, "  [{}] {}{}", task.id, task.title, deps);
            }
        }
        out
    }
}
