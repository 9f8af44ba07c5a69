//! Worktree management for GitWorkspace
//!
//! Contains methods for creating, listing, and removing worktrees

use git2::{Error as GitError, Repository, Worktree};
use std::path::Path;

use crate::git::types::WorktreeInfo;
use crate::git::GitWorkspace;

impl GitWorkspace {
    /// Create a worktree checked out on the given branch. The branch is
    /// created from `base` (or HEAD) if it does not exist yet.
    pub fn create_worktree(
        &self,
        branch: &str,
        path: &str,
        base: Option<&str>,
    ) -> Result<WorktreeInfo, GitError> {
        use git2::WorktreeAddOptions;

        if !self.branch_exists(branch) {
            self.create_branch(branch, base, false)?;
        }

        let branch_ref = self.repo.find_branch(branch, git2::BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Sanitize the worktree name to avoid nested directories in
        // .git/worktrees/. Branch names like "task/uuid" would otherwise
        // create ".git/worktrees/task/uuid", which fails.
        let worktree_name = branch.replace('/', "-");

        let worktree = self
            .repo
            .worktree(&worktree_name, Path::new(path), Some(&opts))?;

        self.worktree_to_info(&worktree)
    }

    /// List all worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove a worktree by path
    /// Searches all worktrees to find one matching the given path
    pub fn remove_worktree(&self, path: &str) -> Result<(), GitError> {
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path().to_string_lossy();
                if worktree_path == path
                    || worktree_path.trim_end_matches('/') == path.trim_end_matches('/')
                {
                    worktree.prune(Some(
                        git2::WorktreePruneOptions::new().valid(true).working_tree(true),
                    ))?;
                    return Ok(());
                }
            }
        }

        // Fallback: treat the path as a worktree name
        if let Ok(worktree) = self.repo.find_worktree(path) {
            worktree.prune(Some(
                git2::WorktreePruneOptions::new().valid(true).working_tree(true),
            ))?;
            return Ok(());
        }

        Err(GitError::from_str(&format!("Worktree not found: {}", path)))
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    /// This cleans up stale entries in .git/worktrees/
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                let worktree_path = worktree.path();
                if !worktree_path.exists() {
                    log::info!(
                        "[Git] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree_path
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[Git] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        // Try to determine the branch for this worktree
        let branch = Repository::open(worktree.path())
            .ok()
            .and_then(|wt_repo| {
                let head = wt_repo.head().ok()?;
                if head.is_branch() {
                    head.shorthand().map(|s| s.to_string())
                } else {
                    None
                }
            });

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            is_locked,
        })
    }
}
