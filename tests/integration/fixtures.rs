//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Writing plan files and agent scripts
//! - Running a plan through the orchestrator

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use wavefront::config::Config;
use wavefront::orchestration::{Orchestrator, RunReport};
use wavefront::plan::Plan;

/// A test repository with a temporary directory and initialized git.
///
/// The repository lives in `<tmp>/repo`; run state goes to `<tmp>/run` so
/// worktrees never land inside the checkout.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        let repo = Self { temp_dir, path };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    /// Branches starting with `prefix`.
    pub fn branches(&self, prefix: &str) -> Vec<String> {
        self.git(&["branch", "--list", "--format=%(refname:short)"])
            .lines()
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect()
    }

    /// Commit subjects of `branch`, oldest first.
    pub fn log_subjects(&self, branch: &str) -> Vec<String> {
        self.git(&["log", "--format=%s", "--reverse", branch])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Contents of `path` at the tip of `branch`.
    pub fn show(&self, branch: &str, path: &str) -> String {
        self.git(&["show", &format!("{}:{}", branch, path)])
    }

    pub fn run_dir(&self) -> PathBuf {
        self.temp_dir.path().join("run")
    }

    /// Write a file next to (not inside) the repository.
    pub fn write_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    pub fn write_plan(&self, text: &str) -> PathBuf {
        self.write_file("plan.md", text)
    }

    /// Config running `agent` with run state under `<tmp>/run`.
    pub fn config(&self, agent: &str) -> Config {
        let mut config = Config::default();
        config.agent.command = agent.to_string();
        config.run.run_dir = Some(self.run_dir().display().to_string());
        config
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Plan, execute and report.
pub async fn run_plan(repo: &TestRepo, plan: &str, config: Config) -> RunReport {
    let plan = Plan::load(&repo.write_plan(plan)).expect("Failed to load plan");
    Orchestrator::new(&repo.path, plan, config)
        .expect("Failed to build orchestrator")
        .quiet()
        .run(CancellationToken::new())
        .await
        .expect("Run failed")
}
