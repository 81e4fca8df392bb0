use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Per-repository config file name.
pub const REPO_CONFIG_FILE: &str = ".wavefront.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub gates: GateConfig,
    pub timeouts: TimeoutConfig,
    pub ralph: RalphConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Shell command run in the worktree; the prompt arrives on stdin.
    pub command: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude -p --dangerously-skip-permissions".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    /// Build/test gate. Skipped when unset.
    pub test_command: Option<String>,
    /// Compliance gate. Falls back to the built-in diff check when unset.
    pub review_command: Option<String>,
    /// Soft quality gate.
    pub lint_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub implementation_secs: u64,
    pub test_secs: u64,
    pub review_secs: u64,
    pub quality_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            implementation_secs: 20 * 60,
            test_secs: 10 * 60,
            review_secs: 5 * 60,
            quality_secs: 3 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn implementation(&self) -> Duration {
        Duration::from_secs(self.implementation_secs)
    }

    pub fn test(&self) -> Duration {
        Duration::from_secs(self.test_secs)
    }

    pub fn review(&self) -> Duration {
        Duration::from_secs(self.review_secs)
    }

    pub fn quality(&self) -> Duration {
        Duration::from_secs(self.quality_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    /// Attempts per task before it is Failed.
    pub max_iterations: u32,
    /// Consecutive identical failures that trigger a strategy shift.
    pub stuck_threshold: u32,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stuck_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub integration_branch: String,
    /// Bus topics and the lease live here. Defaults to ~/.wavefront/runs/<repo>.
    pub run_dir: Option<String>,
    /// Defaults to <run_dir>/worktrees.
    pub worktree_dir: Option<String>,
    /// Global deadline for the whole run.
    pub deadline_secs: Option<u64>,
    pub max_concurrent: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            integration_branch: "wavefront/integration".to_string(),
            run_dir: None,
            worktree_dir: None,
            deadline_secs: None,
            max_concurrent: 3,
        }
    }
}

impl Config {
    pub fn wavefront_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".wavefront"))
    }

    pub fn global_config_path() -> Result<PathBuf> {
        Ok(Self::wavefront_dir()?.join("config.toml"))
    }

    /// Load from `<repo>/.wavefront.toml`, then `~/.wavefront/config.toml`,
    /// else defaults.
    pub fn discover(repo: &Path) -> Result<Self> {
        let local = repo.join(REPO_CONFIG_FILE);
        if local.exists() {
            return Self::load_from(&local);
        }
        match Self::global_config_path() {
            Ok(global) if global.exists() => Self::load_from(&global),
            _ => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(Error::Validation("agent.command must not be empty".into()));
        }
        if self.ralph.max_iterations == 0 {
            return Err(Error::Validation("ralph.max_iterations must be at least 1".into()));
        }
        if self.ralph.stuck_threshold == 0 {
            return Err(Error::Validation("ralph.stuck_threshold must be at least 1".into()));
        }
        if self.run.max_concurrent == 0 {
            return Err(Error::Validation("run.max_concurrent must be at least 1".into()));
        }
        if self.run.integration_branch.trim().is_empty() {
            return Err(Error::Validation("run.integration_branch must not be empty".into()));
        }
        Ok(())
    }

    /// Run directory for `repo`.
    pub fn run_dir(&self, repo: &Path) -> Result<PathBuf> {
        match &self.run.run_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => {
                let name = repo
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "repo".to_string());
                Ok(Self::wavefront_dir()?.join("runs").join(name))
            }
        }
    }

    pub fn worktree_dir(&self, repo: &Path) -> Result<PathBuf> {
        match &self.run.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(self.run_dir(repo)?.join("worktrees")),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.run.deadline_secs.map(Duration::from_secs)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
