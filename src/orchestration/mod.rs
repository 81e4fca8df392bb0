//! Orchestration layer for wavefront.
//!
//! The scheduler tracks task state, the workspace manager runs each task in
//! its own worktree under the Ralph Loop, the merge pipeline squashes finished
//! branches into the integration branch, and the orchestrator drives the wave
//! loop over all of them.

pub mod bus;
pub mod gates;
pub mod lease;
pub mod merge;
pub mod orchestrator;
pub mod process;
pub mod ralph;
pub mod report;
pub mod scheduler;
pub mod workspace;

pub use bus::{BusMessage, MessageBus};
pub use gates::{Gate, GateVerdict, Gates};
pub use lease::RunLease;
pub use merge::{MergeOutcome, MergePipeline, MergeRequest};
pub use orchestrator::{Orchestrator, WavePhase};
pub use process::{ProcessExit, ProcessOutcome, ShellCommand};
pub use ralph::{AttemptRecord, RalphState};
pub use report::{RunReport, TaskReport};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use workspace::{TaskContext, TaskRunOutcome, WorkspaceManager, WorktreeHandle};
