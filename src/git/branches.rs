//! Branch operations for GitWorkspace
//!
//! Contains methods for creating, deleting, and checking out branches

use git2::{Branch, BranchType, Commit, Error as GitError, Signature};

use crate::git::types::{BranchInfo, CommitInfo};
use crate::git::GitWorkspace;

impl GitWorkspace {
    /// Create a new branch from the given base ref, or from HEAD when no
    /// base is given. With `force`, an existing branch is reset to the base.
    pub fn create_branch(
        &self,
        name: &str,
        base: Option<&str>,
        force: bool,
    ) -> Result<BranchInfo, GitError> {
        let base_commit = match base {
            Some(base_ref) => self
                .repo
                .find_branch(base_ref, BranchType::Local)?
                .get()
                .peel_to_commit()?,
            None => self.head_commit()?,
        };

        let branch = self.repo.branch(name, &base_commit, force)?;
        self.branch_to_info(&branch)
    }

    /// HEAD commit, creating an initial commit first if the repository has
    /// none yet.
    pub(crate) fn head_commit(&self) -> Result<Commit<'_>, GitError> {
        let head = match self.repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
                log::info!("[Git] No commits found, creating initial commit");
                self.create_initial_commit()?;
                self.repo.head()?
            }
            Err(e) => return Err(e),
        };
        head.peel_to_commit()
    }

    /// Create an initial empty commit for a new repository
    pub(crate) fn create_initial_commit(&self) -> Result<(), GitError> {
        let tree_id = self.repo.index()?.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let signature = self
            .repo
            .signature()
            .or_else(|_| Signature::now("Ralph Engine", "ralph@example.com"))?;

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            "Initial commit (created by ralph-engine)",
            &tree,
            &[],
        )?;

        log::info!("[Git] Created initial commit");
        Ok(())
    }

    /// Delete a branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Commit id a local branch currently points at
    pub fn branch_head(&self, name: &str) -> Result<String, GitError> {
        let branch = self.repo.find_branch(name, BranchType::Local)?;
        Ok(branch.get().peel_to_commit()?.id().to_string())
    }

    /// Checkout a branch in the primary working directory
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let obj = self.repo.revparse_single(&format!("refs/heads/{}", name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    /// Convert a Branch to BranchInfo
    pub(crate) fn branch_to_info(&self, branch: &Branch) -> Result<BranchInfo, GitError> {
        let name = branch.name()?.unwrap_or("").to_string();
        let is_head = branch.is_head();

        let commit = branch.get().peel_to_commit()?;
        let commit_id = commit.id().to_string();

        Ok(BranchInfo {
            name,
            is_head,
            commit_id,
        })
    }

    /// Convert a Commit to CommitInfo
    pub(crate) fn commit_to_info(&self, commit: &Commit) -> Result<CommitInfo, GitError> {
        let author = commit.author();

        Ok(CommitInfo {
            id: commit.id().to_string(),
            short_id: commit.id().to_string()[..7].to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
        })
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order:
    /// 1. Current HEAD branch (if HEAD points to a branch)
    /// 2. First existing common default branch ("main", "master")
    /// 3. Fallback to "main"
    pub fn default_branch_name(&self) -> String {
        if let Ok(head) = self.repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return name.to_string();
                }
            }
        }

        for name in &["main", "master"] {
            if self.repo.find_branch(name, BranchType::Local).is_ok() {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }
}
