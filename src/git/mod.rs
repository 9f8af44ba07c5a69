//! Git operations using git2-rs
//!
//! VCS access layer shared by the worktree manager and the loop engine,
//! organized into focused submodules:
//! - `workspace` - Core GitWorkspace struct and basic operations
//! - `branches` - Branch operations (create, delete, checkout)
//! - `worktrees` - Worktree management (add, remove, prune)
//! - `commits` - Commit operations (create, range enumeration)
//! - `merge` - Merge and conflict detection
//! - `push` - Remote push with credential callbacks
//! - `types` - Shared data structures

// Submodules
mod branches;
mod commits;
mod merge;
mod push;
#[cfg(test)]
mod tests;
mod types;
mod workspace;
mod worktrees;

// Re-export the main GitWorkspace struct
pub use workspace::GitWorkspace;

// Re-export all types for public use
pub use types::{BranchInfo, CommitInfo, MergeResult, WorktreeInfo};
