//! Run lease: marks a run directory as owned by one live process.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::git::GitOps;
use crate::{Error, Result};

pub const LEASE_FILE: &str = "lease.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub repo: PathBuf,
    #[serde(skip)]
    path: PathBuf,
}

impl RunLease {
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(LEASE_FILE)
    }

    /// Read the lease in `run_dir`, if any.
    pub fn read(run_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(run_dir);
        if !path.exists() {
            return Ok(None);
        }
        let mut lease: RunLease = serde_json::from_slice(&fs::read(&path)?)?;
        lease.path = path;
        Ok(Some(lease))
    }

    /// Take the lease for the current process.
    ///
    /// A lease held by another live process is `RunInProgress`. A lease left
    /// by a dead process is stale: its orphaned worktree entries are pruned
    /// and the lease is taken over.
    pub fn acquire(run_dir: &Path, git: &GitOps) -> Result<Self> {
        let own_pid = std::process::id();
        if let Some(existing) = Self::read(run_dir)? {
            if existing.pid != own_pid && is_alive(existing.pid) {
                return Err(Error::RunInProgress {
                    pid: existing.pid,
                    started_at: existing.started_at.to_rfc3339(),
                });
            }
            if existing.pid != own_pid {
                tracing::warn!(
                    pid = existing.pid,
                    started_at = %existing.started_at,
                    "found stale run lease, taking over"
                );
                let pruned = git.prune_worktrees()?;
                if pruned > 0 {
                    tracing::info!(pruned, "pruned stale worktrees");
                }
            }
        }

        fs::create_dir_all(run_dir)?;
        let lease = RunLease {
            pid: own_pid,
            started_at: Utc::now(),
            repo: git.repo_path().to_path_buf(),
            path: Self::path_in(run_dir),
        };
        let temp_path = lease.path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(&lease)?)?;
        fs::rename(&temp_path, &lease.path)?;
        tracing::debug!(pid = own_pid, path = %lease.path.display(), "lease acquired");
        Ok(lease)
    }

    /// Remove the lease file if it is still ours.
    pub fn release(self) -> Result<()> {
        let Some(dir) = self.path.parent() else {
            return Ok(());
        };
        match Self::read(dir)? {
            Some(current) if current.pid == self.pid => {
                fs::remove_file(&self.path)?;
                tracing::debug!(path = %self.path.display(), "lease released");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Whether `pid` names a running process.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
