//! Worktree lifecycle for plan task execution
//!
//! Every dispatched task gets an isolated working copy on its own branch,
//! created from the plan's base ref and torn down after the critic approves
//! or the task fails. Worktrees are never reused: a task id is bound to at
//! most one worktree for the lifetime of the manager, and a fresh run after
//! `reset` starts from a clean slate.
//!
//! The manager holds the repository path and opens a [`GitWorkspace`] per
//! operation. The owning scheduler task is the only caller, which keeps
//! acquire and release serialized per task id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{EngineConfig, GithubConfig};
use crate::error::EngineError;
use crate::git::{CommitInfo, GitWorkspace};
use crate::github::{CreatePrRequest, GitHubClient};
use crate::models::{
    BranchStrategy, CommitSummary, CriticStatus, GitSummary, PlanWorktree, Task, WorktreeStatus,
};
use crate::retry::{with_retry, RetryConfig};

fn task_branch(task_id: &str) -> String {
    format!("task/{}", task_id)
}

/// Manages worktree allocation, branch integration, and critic gate state
/// for one plan.
#[derive(Debug)]
pub struct WorktreeManager {
    plan_id: String,
    repo_path: PathBuf,
    worktree_base: PathBuf,
    base_branch: String,
    github: Option<GithubConfig>,
    retry: RetryConfig,
    /// Allocation records by task id, live and cleaned alike. Cleaned
    /// records are kept so reuse attempts can be rejected.
    records: HashMap<String, PlanWorktree>,
    /// Base commit each task branch was created from, for commit
    /// enumeration.
    branch_points: HashMap<String, String>,
}

impl WorktreeManager {
    /// Create a manager for the repository at `project_path`. Resolves the
    /// plan's base branch up front; a configured base branch that does not
    /// exist is rejected here rather than at first acquire.
    pub fn new(
        plan_id: &str,
        project_path: &Path,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let workspace = GitWorkspace::open(project_path)?;

        let base_branch = match &config.git.base_branch {
            Some(branch) => {
                if !workspace.branch_exists(branch) {
                    return Err(EngineError::Vcs(format!(
                        "Base branch '{}' not found in repository",
                        branch
                    )));
                }
                branch.clone()
            }
            None => {
                // Ensures a just-initialized repository gains an initial
                // commit so the default branch actually exists.
                workspace.head_commit()?;
                workspace.default_branch_name()
            }
        };

        let worktree_base = match &config.git.worktree_base {
            Some(base) => PathBuf::from(base),
            None => project_path.join(".ralph-engine").join("worktrees"),
        };

        Ok(Self {
            plan_id: plan_id.to_string(),
            repo_path: project_path.to_path_buf(),
            worktree_base,
            base_branch,
            github: config.github.clone(),
            retry: config.retry.clone(),
            records: HashMap::new(),
            branch_points: HashMap::new(),
        })
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Shared integration branch for the `feature_branch` strategy.
    pub fn integration_branch(&self) -> String {
        format!("ralph/{}", self.plan_id)
    }

    fn open(&self) -> Result<GitWorkspace, EngineError> {
        Ok(GitWorkspace::open(&self.repo_path)?)
    }

    fn record_mut(&mut self, task_id: &str) -> Result<&mut PlanWorktree, EngineError> {
        self.records
            .get_mut(task_id)
            .ok_or_else(|| EngineError::WorktreeConflict {
                task_id: task_id.to_string(),
                reason: "no worktree allocated".to_string(),
            })
    }

    /// Create the task's branch and worktree. Fails with a conflict if the
    /// task already holds a worktree, live or cleaned.
    pub fn acquire(&mut self, task_id: &str) -> Result<PathBuf, EngineError> {
        if let Some(existing) = self.records.get(task_id) {
            let reason = match existing.status {
                WorktreeStatus::Active => "a live worktree already exists".to_string(),
                WorktreeStatus::Cleaned => {
                    "the task's worktree was already used and cleaned".to_string()
                }
            };
            return Err(EngineError::WorktreeConflict {
                task_id: task_id.to_string(),
                reason,
            });
        }

        let workspace = self.open()?;
        let branch = task_branch(task_id);
        let path = self.worktree_base.join(&self.plan_id).join(task_id);

        if path.exists() {
            // Leftover from an earlier run that never released
            log::warn!(
                "[Worktree] Removing stale worktree directory {}",
                path.display()
            );
            std::fs::remove_dir_all(&path)
                .map_err(|e| EngineError::Vcs(format!("Failed to remove stale worktree: {}", e)))?;
            let _ = workspace.prune_orphaned_worktrees();
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Vcs(format!("Failed to create worktree base directory: {}", e))
            })?;
        }

        let branch_point = workspace.branch_head(&self.base_branch)?;
        workspace.create_branch(&branch, Some(&self.base_branch), true)?;
        let path_str = path.to_string_lossy().to_string();
        workspace.create_worktree(&branch, &path_str, Some(&self.base_branch))?;

        self.branch_points
            .insert(task_id.to_string(), branch_point);
        self.records.insert(
            task_id.to_string(),
            PlanWorktree {
                task_id: task_id.to_string(),
                path: path_str,
                branch: branch.clone(),
                status: WorktreeStatus::Active,
                critic_status: CriticStatus::Pending,
                critic_iteration: 0,
                created_at: Utc::now(),
            },
        );
        log::info!(
            "[Worktree] Created worktree for task {} on branch {}",
            task_id,
            branch
        );
        Ok(path)
    }

    /// Prune the worktree and delete its directory. Idempotent: releasing
    /// an unknown or already-cleaned task logs and no-ops. Rejected while
    /// the critic is reviewing the worktree.
    pub fn release(&mut self, task_id: &str) -> Result<(), EngineError> {
        let (path, critic_status) = match self.records.get(task_id) {
            None => {
                log::warn!(
                    "[Worktree] Release for task {} without a worktree, ignoring",
                    task_id
                );
                return Ok(());
            }
            Some(record) if record.status == WorktreeStatus::Cleaned => {
                log::warn!(
                    "[Worktree] Worktree for task {} already cleaned, ignoring release",
                    task_id
                );
                return Ok(());
            }
            Some(record) => (record.path.clone(), record.critic_status),
        };

        if critic_status == CriticStatus::Reviewing {
            return Err(EngineError::WorktreeConflict {
                task_id: task_id.to_string(),
                reason: "critic review in progress".to_string(),
            });
        }

        let workspace = self.open()?;
        if let Err(e) = workspace.remove_worktree(&path) {
            log::warn!(
                "[Worktree] Git removal of worktree for task {} failed ({}), deleting directory",
                task_id,
                e
            );
            if Path::new(&path).exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            let _ = workspace.prune_orphaned_worktrees();
        }

        if let Some(record) = self.records.get_mut(task_id) {
            record.status = WorktreeStatus::Cleaned;
        }
        log::info!("[Worktree] Released worktree for task {}", task_id);
        Ok(())
    }

    /// Release every live worktree, best effort. Reviews in flight are
    /// aborted first; used on cancellation and reset where the review
    /// outcome no longer matters.
    pub fn release_all(&mut self) {
        let task_ids: Vec<String> = self
            .records
            .values()
            .filter(|r| r.status == WorktreeStatus::Active)
            .map(|r| r.task_id.clone())
            .collect();
        for task_id in task_ids {
            self.abort_review(&task_id);
            if let Err(e) = self.release(&task_id) {
                log::warn!(
                    "[Worktree] Failed to release worktree for task {}: {}",
                    task_id,
                    e
                );
            }
        }
    }

    /// Integrate an approved task's work per the plan's branch strategy.
    /// Returns the git summary contribution (new commits, opened PRs).
    pub async fn finalize(
        &self,
        task: &Task,
        strategy: BranchStrategy,
    ) -> Result<GitSummary, EngineError> {
        match self.records.get(&task.id) {
            Some(record) if record.status == WorktreeStatus::Active => {}
            Some(_) => {
                return Err(EngineError::WorktreeConflict {
                    task_id: task.id.clone(),
                    reason: "worktree already cleaned".to_string(),
                })
            }
            None => {
                return Err(EngineError::WorktreeConflict {
                    task_id: task.id.clone(),
                    reason: "no worktree allocated".to_string(),
                })
            }
        }

        match strategy {
            BranchStrategy::FeatureBranch => self.merge_into_integration(task),
            BranchStrategy::RaisePrs => self.push_and_open_pr(task).await,
        }
    }

    fn merge_into_integration(&self, task: &Task) -> Result<GitSummary, EngineError> {
        let workspace = self.open()?;
        let task_branch = task_branch(&task.id);
        let integration = self.integration_branch();

        if !workspace.branch_exists(&integration) {
            workspace.create_branch(&integration, Some(&self.base_branch), false)?;
        }

        let pre_merge_head = workspace.branch_head(&integration)?;
        let merge = workspace.merge_branch(&task_branch, &integration)?;
        if !merge.success {
            let conflicts = merge.conflict_files.join(", ");
            if let Err(e) = workspace.merge_abort() {
                log::warn!("[Worktree] Failed to abort conflicted merge: {}", e);
            }
            let _ = workspace.checkout_branch(&self.base_branch);
            return Err(EngineError::Vcs(format!(
                "Merge of {} into {} has conflicts: {}",
                task_branch, integration, conflicts
            )));
        }

        let commits = workspace.commits_in_range(Some(&pre_merge_head), &integration)?;
        if let Err(e) = workspace.checkout_branch(&self.base_branch) {
            log::warn!(
                "[Worktree] Could not return to {} after merge: {}",
                self.base_branch,
                e
            );
        }
        log::info!(
            "[Worktree] Merged {} into {} ({} new commits)",
            task_branch,
            integration,
            commits.len()
        );
        Ok(GitSummary {
            commits: commits.into_iter().map(CommitSummary::from).collect(),
            pull_requests: Vec::new(),
        })
    }

    async fn push_and_open_pr(&self, task: &Task) -> Result<GitSummary, EngineError> {
        let github = match &self.github {
            Some(github) => github.clone(),
            None => {
                return Err(EngineError::Vcs(
                    "raise_prs strategy requires a [github] configuration".to_string(),
                ))
            }
        };
        let task_branch = task_branch(&task.id);
        let commits = self.task_commits(&task.id)?;

        // Push with retry. Each attempt opens the repository fresh so no
        // git handle is held across the backoff sleeps.
        let repo_path = self.repo_path.clone();
        let branch = task_branch.clone();
        let token = github.token.clone();
        let push = with_retry(
            move || {
                let repo_path = repo_path.clone();
                let branch = branch.clone();
                let token = token.clone();
                async move {
                    let workspace =
                        GitWorkspace::open(&repo_path).map_err(|e| e.message().to_string())?;
                    workspace
                        .push_branch(&branch, Some(&token), false)
                        .map_err(|e| e.message().to_string())
                }
            },
            &self.retry,
            None::<fn(u32, &str, u64)>,
        )
        .await;
        push.result.map_err(EngineError::Vcs)?;

        let client = GitHubClient::new(github.token.clone(), github.owner.clone(), github.repo);
        let request = CreatePrRequest {
            title: task.subject.clone(),
            body: format!("Automated changes for task `{}`.\n\n{}", task.id, task.subject),
            head: task_branch,
            base: self.base_branch.clone(),
            draft: false,
        };
        let pr = with_retry(
            || client.create_pull_request(request.clone()),
            &self.retry,
            None::<fn(u32, &str, u64)>,
        )
        .await;
        let pr = pr.result.map_err(EngineError::Vcs)?;

        log::info!("[Worktree] Opened PR #{} for task {}", pr.number, task.id);
        Ok(GitSummary {
            commits: commits.into_iter().map(CommitSummary::from).collect(),
            pull_requests: vec![pr.into()],
        })
    }

    /// Commits the task's branch added on top of its branch point, newest
    /// first.
    pub fn task_commits(&self, task_id: &str) -> Result<Vec<CommitInfo>, EngineError> {
        let workspace = self.open()?;
        let branch = task_branch(task_id);
        let since = match self.branch_points.get(task_id) {
            Some(oid) => oid.clone(),
            None => workspace.branch_head(&self.base_branch)?,
        };
        Ok(workspace.commits_in_range(Some(&since), &branch)?)
    }

    /// Move the task's critic gate to `reviewing` and return the attempt
    /// number for the upcoming review (1-based).
    pub fn begin_review(&mut self, task_id: &str) -> Result<u32, EngineError> {
        let record = self.record_mut(task_id)?;
        if record.status != WorktreeStatus::Active {
            return Err(EngineError::WorktreeConflict {
                task_id: task_id.to_string(),
                reason: "worktree already cleaned".to_string(),
            });
        }
        record.critic_status = CriticStatus::Reviewing;
        Ok(record.critic_iteration + 1)
    }

    pub fn record_approval(&mut self, task_id: &str) -> Result<(), EngineError> {
        let record = self.record_mut(task_id)?;
        record.critic_status = CriticStatus::Approved;
        Ok(())
    }

    /// Record a rejection and return the total rejection count so far.
    pub fn record_rejection(&mut self, task_id: &str) -> Result<u32, EngineError> {
        let record = self.record_mut(task_id)?;
        record.critic_status = CriticStatus::Rejected;
        record.critic_iteration += 1;
        Ok(record.critic_iteration)
    }

    /// Drop an in-flight review so the worktree can be released. No-op when
    /// nothing is under review.
    pub fn abort_review(&mut self, task_id: &str) {
        if let Some(record) = self.records.get_mut(task_id) {
            if record.critic_status == CriticStatus::Reviewing {
                log::info!("[Worktree] Aborting critic review for task {}", task_id);
                record.critic_status = CriticStatus::Pending;
            }
        }
    }

    pub fn record(&self, task_id: &str) -> Option<&PlanWorktree> {
        self.records.get(task_id)
    }

    /// Snapshot of all allocation records, sorted by task id for stable
    /// persistence.
    pub fn records(&self) -> Vec<PlanWorktree> {
        let mut records: Vec<PlanWorktree> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }

    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == WorktreeStatus::Active)
            .count()
    }

    /// Full reset for a plan restart: release everything, forget all
    /// records, prune orphans, and drop the integration branch so the next
    /// run re-integrates from scratch.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.release_all();
        self.records.clear();
        self.branch_points.clear();

        let workspace = self.open()?;
        let pruned = workspace.prune_orphaned_worktrees()?;
        if pruned > 0 {
            log::info!("[Worktree] Pruned {} orphaned worktrees during reset", pruned);
        }

        let integration = self.integration_branch();
        if workspace.branch_exists(&integration) {
            let _ = workspace.checkout_branch(&self.base_branch);
            if let Err(e) = workspace.delete_branch(&integration) {
                log::warn!(
                    "[Worktree] Could not delete integration branch {}: {}",
                    integration,
                    e
                );
            }
        }
        Ok(())
    }
}
