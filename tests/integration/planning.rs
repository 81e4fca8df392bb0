//! Plan files to waves.

use wavefront::core::TaskId;
use wavefront::plan::Plan;
use wavefront::Error;

use crate::fixtures::TestRepo;

fn wave_ids(plan: &Plan) -> Vec<Vec<u32>> {
    plan.waves
        .iter()
        .map(|w| w.tasks.iter().map(|id| id.0).collect())
        .collect()
}

#[test]
fn test_join_task_waits_for_both_parents() {
    let repo = TestRepo::new();
    let path = repo.write_plan(
        "# Plan\n\nSome preamble.\n\n\
         ## Task 1: Data model\nDefine the structs.\n\n\
         ## Task 2: Storage\nPersist them.\n\n\
         ## Task 3: API\ndepends: [1, 2]\nExpose both.\n",
    );
    let plan = Plan::load(&path).unwrap();
    assert_eq!(wave_ids(&plan), vec![vec![1, 2], vec![3]]);
    assert_eq!(plan.task(TaskId(3)).unwrap().body, "Expose both.");
}

#[test]
fn test_shared_file_puts_tasks_in_separate_waves() {
    let repo = TestRepo::new();
    let path = repo.write_plan("## Task 1: a\nfiles: [a.go]\n\n## Task 2: b\nfiles: [a.go]\n");
    let plan = Plan::load(&path).unwrap();
    assert_eq!(wave_ids(&plan), vec![vec![1], vec![2]]);
}

#[test]
fn test_toml_plan() {
    let repo = TestRepo::new();
    let path = repo.write_file(
        "plan.toml",
        r#"
[[task]]
id = 2
title = "Second"
depends = [1]

[[task]]
id = 1
title = "First"
files = ["src/lib.rs"]
body = "Start here."
"#,
    );
    let plan = Plan::load(&path).unwrap();
    assert_eq!(wave_ids(&plan), vec![vec![1], vec![2]]);
    assert_eq!(plan.task(TaskId(1)).unwrap().body, "Start here.");
}

#[test]
fn test_overlap_closing_a_cycle_is_rejected() {
    let repo = TestRepo::new();
    let path = repo.write_plan(
        "## Task 1: a\ndepends: [3]\nfiles: [shared.rs]\n\
         ## Task 2: b\nfiles: [shared.rs]\n\
         ## Task 3: c\ndepends: [2]\n",
    );
    match Plan::load(&path) {
        Err(Error::CyclicOverlap { cycle }) => {
            assert_eq!(cycle, vec![TaskId(1), TaskId(2), TaskId(3)]);
        }
        other => panic!("expected CyclicOverlap, got {:?}", other),
    }
}

#[test]
fn test_structural_errors() {
    let repo = TestRepo::new();
    for (text, what) in [
        ("no tasks here\n", "empty plan"),
        ("## Task 1: a\n## Task 1: b\n", "duplicate id"),
        ("## Task 1: a\ndepends: [9]\n", "unknown dependency"),
        ("## Task 0: zero\n", "zero id"),
    ] {
        let err = Plan::load(&repo.write_plan(text)).unwrap_err();
        assert!(matches!(err, Error::MalformedPlan(_)), "{}: {:?}", what, err);
    }

    let err = Plan::load(&repo.write_plan("## Task 1: a\ndepends: [2]\n## Task 2: b\ndepends: [1]\n"))
        .unwrap_err();
    assert!(matches!(err, Error::CyclicPlan { .. }));
}
