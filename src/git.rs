use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::Result;

/// Git operations against the repository wavefront orchestrates.
///
/// Handles are cheap: every call reopens the repository so a `GitOps` can be
/// moved into `spawn_blocking` closures freely.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    pub(crate) fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub(crate) fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Wavefront", "wavefront@localhost"))?)
    }

    /// Create `branch` at `base_commit` and check it out in a new worktree.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, base_commit: &str) -> Result<()> {
        tracing::debug!(
            branch,
            path = %worktree_path.display(),
            base = base_commit,
            "GitOps::create_worktree"
        );
        let repo = self.repo()?;
        let commit = repo.find_commit(Oid::from_str(base_commit)?)?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes, the folder name does not
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Check out an existing branch in a new worktree (resuming an interrupted run).
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        tracing::debug!(branch, path = %worktree_path.display(), "GitOps::create_worktree_from_branch");
        let repo = self.repo()?;
        let branch_ref = repo.find_branch(branch, BranchType::Local)?;
        let reference = branch_ref.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);

        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree directory and its admin entry, keeping the branch.
    ///
    /// The admin dir under `.git/worktrees/` must go too, otherwise git still
    /// considers the branch checked out and a later worktree on it fails.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        tracing::debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    tracing::warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                tracing::debug!(dir = %admin_dir.display(), "cleaning worktree admin dir");
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        Ok(())
    }

    /// Prune admin entries of worktrees whose directories are gone.
    ///
    /// Returns the number of entries pruned.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let mut pruned = 0;
        for name in worktrees.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if worktree.path().exists() {
                continue;
            }
            let _ = worktree.unlock();
            if worktree
                .prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ))
                .is_ok()
            {
                pruned += 1;
            }
        }

        tracing::debug!(pruned, "prune_worktrees");
        Ok(pruned)
    }

    /// Whether `path` is a live worktree of this repository.
    pub fn is_worktree(&self, path: &Path) -> bool {
        path.exists() && Repository::open(path).map(|r| r.is_worktree()).unwrap_or(false)
    }

    /// Stage everything in the worktree and commit it.
    ///
    /// Returns the new commit id, or `None` when there was nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Self::commit_index(&repo, &mut index, message)
    }

    /// Stage files one at a time and commit whatever could be staged.
    ///
    /// Fallback for [`commit_all`](Self::commit_all) when bulk staging fails
    /// (nested repositories, unreadable paths). Such paths are skipped with a
    /// warning; everything else lands in the commit.
    pub fn commit_snapshot(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;

        let mut files = Vec::new();
        collect_files(worktree_path, Path::new(""), &mut files)?;
        for path in files {
            if repo.is_path_ignored(&path).unwrap_or(false) {
                continue;
            }
            if let Err(e) = index.add_path(&path) {
                tracing::warn!(path = %path.display(), error = %e, "skipping path in snapshot");
            }
        }
        if let Err(e) = index.update_all(["."].iter(), None) {
            tracing::warn!(error = %e, "could not stage deletions in snapshot");
        }
        index.write()?;
        Self::commit_index(&repo, &mut index, message)
    }

    fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Result<Option<String>> {
        let tree_id = index.write_tree()?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(ref parent) = parent {
            if parent.tree_id() == tree_id {
                return Ok(None);
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(commit = %commit_id, "commit created");
        Ok(Some(commit_id.to_string()))
    }

    /// Commit id checked out in a worktree.
    pub fn worktree_head(&self, worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Tip commit of a local branch, if it exists.
    pub fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(b) => Ok(Some(b.get().peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branch_head(branch)?.is_some())
    }

    /// Make sure `branch` exists, creating it at HEAD when missing.
    ///
    /// Returns the branch tip.
    pub fn ensure_branch(&self, branch: &str) -> Result<String> {
        if let Some(tip) = self.branch_head(branch)? {
            return Ok(tip);
        }
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &head, false)?;
        tracing::info!(branch, commit = %head.id(), "created integration branch");
        Ok(head.id().to_string())
    }

    /// Create a branch pointing at `commit`.
    pub fn create_branch_at(&self, branch: &str, commit: &str) -> Result<()> {
        let repo = self.repo()?;
        let commit = repo.find_commit(Oid::from_str(commit)?)?;
        repo.branch(branch, &commit, false)?;
        Ok(())
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let repo = self.repo()?;
        Ok(repo.merge_base(Oid::from_str(a)?, Oid::from_str(b)?)?.to_string())
    }

    /// Paths that differ between two commits.
    pub fn changed_files(&self, base: &str, head: &str) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let base_tree = repo.find_commit(Oid::from_str(base)?)?.tree()?;
        let head_tree = repo.find_commit(Oid::from_str(head)?)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;

        let mut files: Vec<PathBuf> = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(Path::to_path_buf)
            })
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Regular files and symlinks under `root/rel`, relative to `root`.
/// `.git` and nested repositories are not descended into.
fn collect_files(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = rel.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.path().join(".git").exists() {
                tracing::warn!(path = %path.display(), "skipping nested repository");
                continue;
            }
            collect_files(root, &path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
