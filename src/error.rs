use thiserror::Error;

use crate::core::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    #[error("Dependency cycle in plan: {}", format_cycle(.cycle))]
    CyclicPlan { cycle: Vec<TaskId> },

    #[error("File overlap inference created a cycle: {}", format_cycle(.cycle))]
    CyclicOverlap { cycle: Vec<TaskId> },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("No free worker slot (max: {max})")]
    CapacityExhausted { max: usize },

    #[error("Another run is in progress (pid {pid}, started {started_at})")]
    RunInProgress { pid: u32, started_at: String },

    #[error("Invalid bus topic: {0}")]
    InvalidTopic(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Structural errors mean the plan itself cannot be executed.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::MalformedPlan(_) | Error::CyclicPlan { .. } | Error::CyclicOverlap { .. }
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
