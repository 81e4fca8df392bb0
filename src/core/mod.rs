//! Core domain models for wavefront.
//!
//! Tasks and the dependency graph that layers them into waves.

pub mod dag;
pub mod task;

pub use dag::{DependencyType, TaskDAG, Wave};
pub use task::{Task, TaskId, TaskStatus, TASK_BRANCH_PREFIX};
