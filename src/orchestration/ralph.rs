//! Ralph Loop retry state.
//!
//! Each task keeps a small JSON record next to its worktree tracking the
//! iteration count and a fingerprint of the last failure. Identical failures
//! in a row mean the agent is stuck, which escalates the next prompt with a
//! strategy-shift directive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::TaskId;
use crate::Result;

/// Directive added to the prompt after repeated identical failures.
pub const STRATEGY_SHIFT_DIRECTIVE: &str = "try a fundamentally different approach";

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub iteration: u32,
    /// Gate that failed (`implementation`, `test`, `review`).
    pub gate: String,
    pub error_hash: String,
    /// Truncated failure output, fed back into later prompts.
    pub summary: String,
    /// This failure triggered a strategy shift.
    pub strategy_shift: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RalphState {
    pub task_id: TaskId,
    /// Failed attempts so far.
    pub iteration: u32,
    pub last_error_hash: Option<String>,
    pub stuck_count: u32,
    pub strategy_shift_pending: bool,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl RalphState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            iteration: 0,
            last_error_hash: None,
            stuck_count: 0,
            strategy_shift_pending: false,
            history: Vec::new(),
        }
    }

    /// `<worktree_root>/task-<id>.ralph.json`
    pub fn path_for(worktree_root: &Path, task_id: TaskId) -> PathBuf {
        worktree_root.join(format!("task-{}.ralph.json", task_id))
    }

    /// Load persisted state, or start fresh when none exists.
    pub fn load(worktree_root: &Path, task_id: TaskId) -> Result<Self> {
        let path = Self::path_for(worktree_root, task_id);
        if !path.exists() {
            return Ok(Self::new(task_id));
        }
        let contents = fs::read_to_string(&path)?;
        let state: RalphState = serde_json::from_str(&contents)?;
        tracing::info!(task = %task_id, iteration = state.iteration, "resuming ralph state");
        Ok(state)
    }

    pub fn save(&self, worktree_root: &Path) -> Result<()> {
        fs::create_dir_all(worktree_root)?;
        let path = Self::path_for(worktree_root, self.task_id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn delete(worktree_root: &Path, task_id: TaskId) -> Result<()> {
        let path = Self::path_for(worktree_root, task_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Record a hard gate failure and update the stuck detector.
    ///
    /// Returns `true` when this failure triggered a strategy shift.
    pub fn record_failure(
        &mut self,
        gate: &str,
        failure_text: &str,
        summary: String,
        stuck_threshold: u32,
    ) -> bool {
        self.iteration += 1;
        let hash = error_hash(failure_text);

        if self.last_error_hash.as_deref() == Some(hash.as_str()) {
            self.stuck_count += 1;
        } else {
            self.stuck_count = 1;
        }

        let shift = self.stuck_count >= stuck_threshold.max(1);
        if shift {
            self.strategy_shift_pending = true;
            self.stuck_count = 0;
            tracing::info!(task = %self.task_id, iteration = self.iteration, "agent stuck, requesting strategy shift");
        }

        self.history.push(AttemptRecord {
            iteration: self.iteration,
            gate: gate.to_string(),
            error_hash: hash.clone(),
            summary,
            strategy_shift: shift,
            recorded_at: Utc::now(),
        });
        self.last_error_hash = Some(hash);
        shift
    }

    /// Consume the pending strategy shift for the next prompt.
    pub fn take_strategy_shift(&mut self) -> bool {
        std::mem::take(&mut self.strategy_shift_pending)
    }

    pub fn cap_reached(&self, max_iterations: u32) -> bool {
        self.iteration >= max_iterations
    }

    /// Most recent failures, oldest first.
    pub fn recent_failures(&self, limit: usize) -> &[AttemptRecord] {
        let start = self.history.len().saturating_sub(limit);
        &self.history[start..]
    }
}

/// SHA-256 of the failure text with digit runs and whitespace normalized,
/// so timings and line numbers do not defeat stuck detection.
pub fn error_hash(text: &str) -> String {
    let digits = DIGITS_RE.replace_all(text.trim(), "#");
    let normalized = WHITESPACE_RE.replace_all(&digits, " ");
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
