//! Commit operations for GitWorkspace
//!
//! Contains methods for creating commits and enumerating ranges

use git2::{BranchType, Error as GitError, Oid, Signature};

use crate::git::types::CommitInfo;
use crate::git::GitWorkspace;

impl GitWorkspace {
    /// Commits reachable from `branch` but not from `since_commit`, newest
    /// first. With `since_commit` unset the whole branch history is walked.
    /// This is the per-task and per-iteration git-summary source.
    pub fn commits_in_range(
        &self,
        since_commit: Option<&str>,
        branch: &str,
    ) -> Result<Vec<CommitInfo>, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;
        let tip = branch_ref.get().peel_to_commit()?.id();

        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(tip)?;
        if let Some(since) = since_commit {
            revwalk.hide(Oid::from_str(since)?)?;
        }

        let mut result = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            result.push(self.commit_to_info(&commit)?);
        }

        Ok(result)
    }

    /// Stage all files
    pub fn stage_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    /// Create a commit from the current index
    pub fn create_commit(
        &self,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<CommitInfo, GitError> {
        let signature = Signature::now(author_name, author_email)?;

        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let parent_commit = self.repo.head()?.peel_to_commit()?;

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent_commit],
        )?;

        let commit = self.repo.find_commit(oid)?;
        self.commit_to_info(&commit)
    }
}
