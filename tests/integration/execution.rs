//! End-to-end runs with scripted agents.

use std::process::Command;

use tokio_util::sync::CancellationToken;

use wavefront::core::{TaskId, TaskStatus};
use wavefront::orchestration::ralph::STRATEGY_SHIFT_DIRECTIVE;
use wavefront::orchestration::{MessageBus, Orchestrator};
use wavefront::plan::Plan;
use wavefront::Error;

use crate::fixtures::{run_plan, TestRepo};

const INTEGRATION: &str = "wavefront/integration";

#[tokio::test]
async fn test_stuck_task_gets_strategy_shift_then_fails() {
    let repo = TestRepo::new();
    let prompts = repo.temp_dir.path().join("prompts.log");
    let agent = format!(
        "cat >> '{log}'; echo '<<END>>' >> '{log}'; echo \"$WAVEFRONT_ITERATION\" > attempt.txt",
        log = prompts.display()
    );
    let mut config = repo.config(&agent);
    config.gates.test_command = Some("echo 'assertion failed: left == right' >&2; exit 1".into());

    let report = run_plan(&repo, "## Task 5: Stubborn\nMake the test pass.\n", config).await;

    let task = &report.tasks[0];
    let TaskStatus::Failed {
        reason,
        preserved_branch: Some(branch),
    } = &task.status
    else {
        panic!("expected Failed with a preserved branch, got {:?}", task.status);
    };
    assert!(reason.starts_with("test gate failed after 5 iteration(s)"), "{}", reason);
    assert!(reason.contains("assertion failed"));
    assert!(branch.starts_with("wip/fail-5-"));
    assert_eq!(repo.branches("wip/fail-5-"), vec![branch.clone()]);
    assert_eq!(repo.show(branch, "attempt.txt"), "5");

    let log = std::fs::read_to_string(&prompts).unwrap();
    let shifts: Vec<bool> = log
        .split("<<END>>")
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.contains(STRATEGY_SHIFT_DIRECTIVE))
        .collect();
    assert_eq!(shifts, vec![false, false, false, true, false]);

    // Nothing reached the integration branch.
    assert_eq!(repo.log_subjects(INTEGRATION), vec!["Initial commit"]);
}

#[tokio::test]
async fn test_merges_follow_ascending_ids_not_completion_order() {
    let repo = TestRepo::new();
    let agent = "cat > /dev/null; \
                 case \"$WAVEFRONT_TASK_ID\" in 1) sleep 1;; 2) sleep 2;; esac; \
                 echo \"$WAVEFRONT_TASK_ID\" > \"task-$WAVEFRONT_TASK_ID.txt\"";

    let report = run_plan(
        &repo,
        "## Task 1: First\n## Task 2: Second\n## Task 3: Third\n",
        repo.config(agent),
    )
    .await;

    assert!(report.is_success(), "{}", report.render());
    assert_eq!(report.waves, 1);
    assert_eq!(
        repo.log_subjects(INTEGRATION),
        vec![
            "Initial commit",
            "task 1: First",
            "task 2: Second",
            "task 3: Third"
        ]
    );
    assert_eq!(repo.show(INTEGRATION, "task-2.txt"), "2");
    // Squash merges: every task commit has a single parent.
    let parents = repo.git(&["rev-list", "--parents", "-n", "1", INTEGRATION]);
    assert_eq!(parents.split_whitespace().count(), 2);
}

#[tokio::test]
async fn test_second_conflict_is_final() {
    let repo = TestRepo::new();
    let script = repo.write_file(
        "agent.sh",
        r#"cat > /dev/null
case "$WAVEFRONT_TASK_ID" in
  1) echo "one" > README.md ;;
  2) echo "two" > README.md ;;
  3) echo "three" > three.txt ;;
esac
if [ "$(git rev-parse --abbrev-ref HEAD)" = "wavefront/task-2-rebase" ]; then
  idx="$(mktemp -d)/index"
  blob=$(echo "moved underneath" | git hash-object -w --stdin)
  GIT_INDEX_FILE="$idx" git read-tree wavefront/integration
  GIT_INDEX_FILE="$idx" git update-index --add --cacheinfo "100644,$blob,README.md"
  tree=$(GIT_INDEX_FILE="$idx" git write-tree)
  rm -rf "$(dirname "$idx")"
  commit=$(git commit-tree "$tree" -p wavefront/integration -m "concurrent change")
  git update-ref refs/heads/wavefront/integration "$commit"
fi
"#,
    );
    let agent = format!("sh '{}'", script.display());

    let report = run_plan(
        &repo,
        "## Task 1: One\n## Task 2: Two\n## Task 3: Three\n",
        repo.config(&agent),
    )
    .await;

    assert!(!report.is_success());
    assert!(report.tasks[0].merged);
    assert!(report.tasks[2].merged);
    match &report.tasks[1].status {
        TaskStatus::MergeFailed {
            conflicts,
            preserved_branch,
        } => {
            assert_eq!(preserved_branch, "wavefront/task-2-rebase");
            assert!(conflicts.iter().any(|p| p.ends_with("README.md")));
        }
        other => panic!("expected MergeFailed, got {:?}", other),
    }
    assert!(repo.branch_exists("wavefront/task-2-rebase"));
    assert_eq!(repo.show(INTEGRATION, "README.md"), "moved underneath");
    assert_eq!(repo.show(INTEGRATION, "three.txt"), "three");
}

#[tokio::test]
async fn test_conflict_reattempt_merges_cleanly() {
    let repo = TestRepo::new();
    let script = repo.write_file(
        "agent.sh",
        r#"cat > /dev/null
case "$WAVEFRONT_TASK_ID" in
  1) echo "one" > README.md ;;
  2) if [ "$(git rev-parse --abbrev-ref HEAD)" = "wavefront/task-2-rebase" ]; then
       echo "two after one" > README.md
     else
       echo "two" > README.md
     fi ;;
esac
"#,
    );
    let agent = format!("sh '{}'", script.display());

    let report = run_plan(&repo, "## Task 1: One\n## Task 2: Two\n", repo.config(&agent)).await;

    assert!(report.is_success(), "{}", report.render());
    assert_eq!(report.tasks[1].status, TaskStatus::Done);
    assert!(report.tasks[1].merged);
    assert_eq!(report.tasks[1].branch, "wavefront/task-2-rebase");
    assert_eq!(
        repo.log_subjects(INTEGRATION),
        vec!["Initial commit", "task 1: One", "task 2: Two"]
    );
    assert_eq!(repo.show(INTEGRATION, "README.md"), "two after one");
}

#[tokio::test]
async fn test_merge_error_fails_only_that_task() {
    let repo = TestRepo::new();
    let agent = "cat > /dev/null; \
                 echo \"$WAVEFRONT_TASK_ID\" > \"task-$WAVEFRONT_TASK_ID.txt\"; \
                 if [ \"$WAVEFRONT_TASK_ID\" = 2 ]; then \
                   git checkout -q -b side && git branch -q -D wavefront/task-2; \
                 fi";

    let report = run_plan(
        &repo,
        "## Task 1: First\n## Task 2: Lost branch\n## Task 3: Third\n",
        repo.config(agent),
    )
    .await;

    assert!(!report.is_success());
    assert!(report.tasks[0].merged);
    assert!(report.tasks[2].merged);
    match &report.tasks[1].status {
        TaskStatus::Failed { reason, .. } => assert!(reason.starts_with("merge failed: "), "{}", reason),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert_eq!(
        repo.log_subjects(INTEGRATION),
        vec!["Initial commit", "task 1: First", "task 3: Third"]
    );
}

#[tokio::test]
async fn test_failed_task_skips_dependents_but_not_siblings() {
    let repo = TestRepo::new();
    let agent = "cat > /dev/null; \
                 [ \"$WAVEFRONT_TASK_ID\" = 1 ] && exit 3; \
                 echo ok > \"task-$WAVEFRONT_TASK_ID.txt\"";
    let mut config = repo.config(agent);
    config.ralph.max_iterations = 2;

    let report = run_plan(
        &repo,
        "## Task 1: Broken\n## Task 2: Fine\n## Task 3: Needs one\ndepends: [1]\n",
        config,
    )
    .await;

    assert_eq!(report.tasks[0].status.label(), "failed");
    assert!(report.tasks[1].merged);
    assert_eq!(
        report.tasks[2].status,
        TaskStatus::SkippedDueToDependencyFailure {
            dependency: TaskId(1)
        }
    );
    assert!(!repo.branch_exists("wavefront/task-3"));
}

#[tokio::test]
async fn test_live_lease_blocks_second_run() {
    let repo = TestRepo::new();
    let mut holder = Command::new("sleep").arg("30").spawn().unwrap();

    let run_dir = repo.run_dir();
    std::fs::create_dir_all(&run_dir).unwrap();
    let lease = serde_json::json!({
        "pid": holder.id(),
        "started_at": "2026-01-01T00:00:00Z",
        "repo": repo.path,
    });
    std::fs::write(run_dir.join("lease.json"), lease.to_string()).unwrap();

    let plan = Plan::load(&repo.write_plan("## Task 1: a\n")).unwrap();
    let result = Orchestrator::new(&repo.path, plan, repo.config("true"))
        .unwrap()
        .quiet()
        .run(CancellationToken::new())
        .await;

    holder.kill().unwrap();
    holder.wait().unwrap();
    assert!(matches!(result, Err(Error::RunInProgress { .. })));
    assert!(!repo.branch_exists(INTEGRATION));
}

#[tokio::test]
async fn test_board_reaches_next_wave() {
    let repo = TestRepo::new();
    let prompts = repo.temp_dir.path().join("prompt-2.txt");
    let agent = format!(
        "if [ \"$WAVEFRONT_TASK_ID\" = 2 ]; then cat > '{}'; else cat > /dev/null; fi; \
         echo done > \"task-$WAVEFRONT_TASK_ID.txt\"",
        prompts.display()
    );

    let report = run_plan(
        &repo,
        "## Task 1: Schema\n## Task 2: Queries\ndepends: [1]\n",
        repo.config(&agent),
    )
    .await;
    assert!(report.is_success(), "{}", report.render());

    let bus = MessageBus::new(&repo.run_dir());
    let wave_two = bus.read("wave-2", 10).unwrap();
    assert_eq!(wave_two[0].kind, "board");
    assert_eq!(wave_two[0].sender, "orchestrator");

    let prompt = std::fs::read_to_string(&prompts).unwrap();
    assert!(prompt.contains("Results of wave 1:"));
    assert!(prompt.contains("task 1 done: Schema"));
}
