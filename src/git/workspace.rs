//! Core GitWorkspace implementation
//!
//! Contains the GitWorkspace struct and its basic operations

use git2::{Error as GitError, Repository};
use std::path::{Path, PathBuf};

/// Workspace handle for repository operations. One instance per repository;
/// all methods are synchronous and are called from the owning scheduler or
/// loop task only.
pub struct GitWorkspace {
    pub(crate) repo: Repository,
}

impl GitWorkspace {
    /// Open the repository at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository's `.git` path
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Get the repository's working directory
    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }
}
