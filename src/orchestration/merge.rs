//! Ordered squash merges into the integration branch.
//!
//! Merges happen in memory (`merge_commits`), so neither the main checkout
//! nor any worktree is touched. A conflicting merge writes nothing.

use std::path::PathBuf;

use git2::{BranchType, Repository};

use crate::core::TaskId;
use crate::git::GitOps;
use crate::Result;

/// A completed task branch waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub task_id: TaskId,
    pub title: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// One squash commit landed on the integration branch.
    Merged { commit: String },
    /// The branch brought no change.
    UpToDate,
    /// Nothing was written.
    Conflict { files: Vec<PathBuf> },
    /// The merge could not be carried out (missing branch, I/O, repository
    /// error). Nothing was written.
    Error { reason: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeOutcome::Conflict { .. })
    }

    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeOutcome::Merged { commit } => Some(commit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergePipeline {
    git: GitOps,
    integration_branch: String,
}

impl MergePipeline {
    pub fn new(git: GitOps, integration_branch: &str) -> Self {
        Self {
            git,
            integration_branch: integration_branch.to_string(),
        }
    }

    /// Merge every request, ascending by task id.
    ///
    /// A conflict or error does not stop the pipeline; later requests merge
    /// against the unchanged integration tip.
    pub fn merge_in_order(&self, mut requests: Vec<MergeRequest>) -> Vec<(TaskId, MergeOutcome)> {
        requests.sort_by_key(|r| r.task_id);
        requests
            .into_iter()
            .map(|request| (request.task_id, self.try_squash_merge(&request)))
            .collect()
    }

    /// [`squash_merge`](Self::squash_merge) with errors folded into the outcome.
    pub fn try_squash_merge(&self, request: &MergeRequest) -> MergeOutcome {
        self.squash_merge(request).unwrap_or_else(|e| {
            tracing::warn!(task = %request.task_id, branch = %request.branch, error = %e, "squash merge error");
            MergeOutcome::Error {
                reason: e.to_string(),
            }
        })
    }

    /// Squash-merge one branch: the integration tip is the only parent.
    pub fn squash_merge(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let repo = self.git.repo()?;
        let target_ref = format!("refs/heads/{}", self.integration_branch);
        let ours = repo.find_reference(&target_ref)?.peel_to_commit()?;
        let theirs = repo
            .find_branch(&request.branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let files = conflict_paths(&index)?;
            tracing::warn!(
                task = %request.task_id,
                branch = %request.branch,
                files = files.len(),
                "squash merge conflicts"
            );
            return Ok(MergeOutcome::Conflict { files });
        }

        let tree_id = index.write_tree_to(&repo)?;
        if tree_id == ours.tree_id() {
            tracing::info!(task = %request.task_id, "branch already merged");
            return Ok(MergeOutcome::UpToDate);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = GitOps::signature(&repo)?;
        let message = format!("task {}: {}", request.task_id, request.title);
        let commit = repo.commit(Some(&target_ref), &sig, &sig, &message, &tree, &[&ours])?;
        warn_if_checked_out(&repo, &target_ref);

        tracing::info!(task = %request.task_id, commit = %commit, "squash merged");
        Ok(MergeOutcome::Merged {
            commit: commit.to_string(),
        })
    }
}

fn conflict_paths(index: &git2::Index) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|entry| PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned()));
        if let Some(path) = path {
            files.push(path);
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn warn_if_checked_out(repo: &Repository, target_ref: &str) {
    let checked_out = repo
        .head()
        .ok()
        .and_then(|head| head.name().map(|n| n == target_ref))
        .unwrap_or(false);
    if checked_out {
        tracing::warn!(branch = target_ref, "integration branch is checked out; working tree is now behind");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{IndexAddOption, Signature};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const INTEGRATION: &str = "wavefront/integration";

    fn create_test_repo() -> (TempDir, GitOps) {
        let temp_dir = TempDir::new().unwrap();
        let repo_dir = temp_dir.path().join("repo");
        fs::create_dir_all(&repo_dir).unwrap();
        let repo = Repository::init(&repo_dir).unwrap();
        fs::write(repo_dir.join("file.txt"), "initial content\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("file.txt")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = Signature::now("Test", "test@test.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
                .unwrap();
        }
        let git = GitOps::new(&repo_dir).unwrap();
        git.ensure_branch(INTEGRATION).unwrap();
        (temp_dir, git)
    }

    /// Create `branch` off the integration tip with `files` written and committed.
    fn branch_with(dir: &TempDir, git: &GitOps, branch: &str, files: &[(&str, &str)]) {
        let base = git.branch_head(INTEGRATION).unwrap().unwrap();
        let wt = dir.path().join(branch.replace('/', "-"));
        git.create_worktree(branch, &wt, &base).unwrap();
        for (name, content) in files {
            fs::write(wt.join(name), content).unwrap();
        }
        let repo = Repository::open(&wt).unwrap();
        let mut index = repo.index().unwrap();
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "work", &tree, &[&parent]).unwrap();
        git.remove_worktree(&wt).unwrap();
    }

    fn request(id: u32, branch: &str) -> MergeRequest {
        MergeRequest {
            task_id: TaskId(id),
            title: format!("title {}", id),
            branch: branch.to_string(),
        }
    }

    fn integration_messages(git: &GitOps) -> Vec<String> {
        let repo = git.repo().unwrap();
        let mut commit = repo
            .find_reference(&format!("refs/heads/{}", INTEGRATION))
            .unwrap()
            .peel_to_commit()
            .unwrap();
        let mut messages = vec![commit.summary().unwrap().to_string()];
        while commit.parent_count() > 0 {
            assert_eq!(commit.parent_count(), 1);
            commit = commit.parent(0).unwrap();
            messages.push(commit.summary().unwrap().to_string());
        }
        messages.reverse();
        messages
    }

    #[test]
    fn test_squash_merge_single_parent() {
        let (dir, git) = create_test_repo();
        branch_with(&dir, &git, "wavefront/task-1", &[("a.txt", "a\n")]);
        let pipeline = MergePipeline::new(git.clone(), INTEGRATION);

        let outcome = pipeline.squash_merge(&request(1, "wavefront/task-1")).unwrap();
        assert!(outcome.is_merged());
        assert_eq!(git.branch_head(INTEGRATION).unwrap().as_deref(), outcome.commit());
        assert_eq!(integration_messages(&git), vec!["Initial commit", "task 1: title 1"]);
    }

    #[test]
    fn test_merges_ascending_regardless_of_completion_order() {
        let (dir, git) = create_test_repo();
        branch_with(&dir, &git, "wavefront/task-1", &[("one.txt", "1\n")]);
        branch_with(&dir, &git, "wavefront/task-2", &[("two.txt", "2\n")]);
        branch_with(&dir, &git, "wavefront/task-3", &[("three.txt", "3\n")]);
        let pipeline = MergePipeline::new(git.clone(), INTEGRATION);

        let outcomes = pipeline
            .merge_in_order(vec![
                request(3, "wavefront/task-3"),
                request(1, "wavefront/task-1"),
                request(2, "wavefront/task-2"),
            ]);
        let order: Vec<u32> = outcomes.iter().map(|(id, _)| id.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(outcomes.iter().all(|(_, o)| o.is_merged()));
        assert_eq!(
            integration_messages(&git),
            vec!["Initial commit", "task 1: title 1", "task 2: title 2", "task 3: title 3"]
        );
    }

    #[test]
    fn test_conflict_writes_nothing_and_continues() {
        let (dir, git) = create_test_repo();
        branch_with(&dir, &git, "wavefront/task-1", &[("file.txt", "from one\n")]);
        branch_with(&dir, &git, "wavefront/task-2", &[("file.txt", "from two\n")]);
        branch_with(&dir, &git, "wavefront/task-3", &[("other.txt", "3\n")]);
        let pipeline = MergePipeline::new(git.clone(), INTEGRATION);

        let outcomes = pipeline
            .merge_in_order(vec![
                request(2, "wavefront/task-2"),
                request(1, "wavefront/task-1"),
                request(3, "wavefront/task-3"),
            ]);

        assert!(outcomes[0].1.is_merged());
        assert_eq!(
            outcomes[1].1,
            MergeOutcome::Conflict {
                files: vec![PathBuf::from("file.txt")]
            }
        );
        assert!(outcomes[2].1.is_merged());
        assert_eq!(
            integration_messages(&git),
            vec!["Initial commit", "task 1: title 1", "task 3: title 3"]
        );
    }

    #[test]
    fn test_unchanged_branch_is_up_to_date() {
        let (_dir, git) = create_test_repo();
        let tip = git.branch_head(INTEGRATION).unwrap().unwrap();
        git.create_branch_at("wavefront/task-1", &tip).unwrap();
        let pipeline = MergePipeline::new(git.clone(), INTEGRATION);

        let outcome = pipeline.squash_merge(&request(1, "wavefront/task-1")).unwrap();
        assert_eq!(outcome, MergeOutcome::UpToDate);
        assert_eq!(git.branch_head(INTEGRATION).unwrap(), Some(tip));
    }

    #[test]
    fn test_missing_branch_is_error() {
        let (_dir, git) = create_test_repo();
        let pipeline = MergePipeline::new(git, INTEGRATION);
        assert!(pipeline.squash_merge(&request(9, "wavefront/task-9")).is_err());
    }

    #[test]
    fn test_error_does_not_stop_later_merges() {
        let (dir, git) = create_test_repo();
        branch_with(&dir, &git, "wavefront/task-1", &[("one.txt", "1\n")]);
        branch_with(&dir, &git, "wavefront/task-3", &[("three.txt", "3\n")]);
        let pipeline = MergePipeline::new(git.clone(), INTEGRATION);

        let outcomes = pipeline.merge_in_order(vec![
            request(3, "wavefront/task-3"),
            request(2, "wavefront/task-2"),
            request(1, "wavefront/task-1"),
        ]);

        assert!(outcomes[0].1.is_merged());
        assert!(matches!(&outcomes[1], (TaskId(2), MergeOutcome::Error { reason }) if !reason.is_empty()));
        assert!(outcomes[2].1.is_merged());
        assert_eq!(
            integration_messages(&git),
            vec!["Initial commit", "task 1: title 1", "task 3: title 3"]
        );
    }
}
