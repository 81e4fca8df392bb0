//! The wavefront binary.

use std::process::{Command, Output};

use crate::fixtures::TestRepo;

fn wavefront(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_wavefront"))
        .args(args)
        .arg("--repo")
        .arg(&repo.path)
        .env("HOME", repo.temp_dir.path())
        .env_remove("WAVEFRONT_LOG")
        .env_remove("WAVEFRONT_DEBUG")
        .output()
        .expect("Failed to run wavefront")
}

fn write_config(repo: &TestRepo, agent: &str) -> String {
    let text = format!(
        "[agent]\ncommand = '{}'\n\n[run]\nrun_dir = '{}'\n",
        agent,
        repo.run_dir().display()
    );
    repo.write_file("wavefront.toml", &text).display().to_string()
}

#[test]
fn test_dry_run_prints_layout_and_touches_nothing() {
    let repo = TestRepo::new();
    let plan = repo.write_plan("## Task 1: Model\n## Task 2: View\ndepends: [1]\n");

    let output = wavefront(&repo, &["--plan", plan.to_str().unwrap(), "--dry-run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("2 task(s) in 2 wave(s)"));
    assert!(stdout.contains("Wave 1/2:"));
    assert!(stdout.contains("[2] View (after 1)"));
    assert!(!repo.branch_exists("wavefront/integration"));
    assert!(!repo.run_dir().exists());
}

#[test]
fn test_malformed_plan_exits_with_two() {
    let repo = TestRepo::new();
    let plan = repo.write_plan("## Task 1: a\ndepends: [1]\n");

    let output = wavefront(&repo, &["--plan", plan.to_str().unwrap(), "--dry-run"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error: "));
}

#[test]
fn test_successful_run_exits_zero() {
    let repo = TestRepo::new();
    let plan = repo.write_plan("## Task 1: Add notes\nfiles: [notes.txt]\n");
    let config = write_config(&repo, "cat > /dev/null; echo hi > notes.txt");

    let output = wavefront(&repo, &["--plan", plan.to_str().unwrap(), "--config", &config]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "{}\n{}", stdout, String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Wave 1/1: dispatching"));
    assert!(stdout.contains("done (merged)"));
    assert_eq!(repo.show("wavefront/integration", "notes.txt"), "hi");
}

#[test]
fn test_failed_task_exits_one() {
    let repo = TestRepo::new();
    let plan = repo.write_plan("## Task 1: Never works\n");
    let config = write_config(&repo, "false");

    let output = wavefront(
        &repo,
        &["--plan", plan.to_str().unwrap(), "--config", &config, "--max-iterations", "1"],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1), "{}", stdout);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("0/1 task(s) merged"));
}
