// Data models for plans, tasks, assignments, and worktrees

pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a plan, from drafting through execution to a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Discussing,
    Discussed,
    Delegating,
    InProgress,
    ReadyForReview,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Discussing => "discussing",
            PlanStatus::Discussed => "discussed",
            PlanStatus::Delegating => "delegating",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::ReadyForReview => "ready_for_review",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further scheduling work.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }

    /// Statuses during which the scheduler dispatches and reacts to workers.
    pub fn is_executing(&self) -> bool {
        matches!(self, PlanStatus::Delegating | PlanStatus::InProgress)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PlanStatus::Draft),
            "discussing" => Ok(PlanStatus::Discussing),
            "discussed" => Ok(PlanStatus::Discussed),
            "delegating" => Ok(PlanStatus::Delegating),
            "in_progress" => Ok(PlanStatus::InProgress),
            "ready_for_review" => Ok(PlanStatus::ReadyForReview),
            "completed" => Ok(PlanStatus::Completed),
            "failed" => Ok(PlanStatus::Failed),
            "cancelled" => Ok(PlanStatus::Cancelled),
            _ => Err(format!("Invalid plan status: '{}'", s)),
        }
    }
}

/// How tasks were decomposed: leadership assigns work down, or workers
/// claim work up. The scheduler treats both identically; the mode is
/// carried for the consumers that built the plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TeamMode {
    TopDown,
    BottomUp,
}

impl Default for TeamMode {
    fn default() -> Self {
        TeamMode::TopDown
    }
}

/// Integration policy for completed task work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    /// Merge every task branch into one shared integration branch.
    FeatureBranch,
    /// Push every task branch and open one pull request per task.
    RaisePrs,
}

impl Default for BranchStrategy {
    fn default() -> Self {
        BranchStrategy::FeatureBranch
    }
}

/// A unit of work decomposed into a dependency graph and executed by agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: PlanStatus,
    pub team_mode: TeamMode,
    pub branch_strategy: BranchStrategy,
    /// Reference agent identity used for workers and the critic.
    pub agent_id: Option<String>,
    pub worktrees: Vec<PlanWorktree>,
    pub git_summary: GitSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(title: &str) -> Self {
        let now = Utc::now();
        Plan {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: None,
            status: PlanStatus::Draft,
            team_mode: TeamMode::default(),
            branch_strategy: BranchStrategy::default(),
            agent_id: None,
            worktrees: Vec::new(),
            git_summary: GitSummary::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A node in the dependency graph. Immutable once the plan starts executing;
/// status lives on the derived graph node, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub subject: String,
    /// Task ids whose completion unblocks this one.
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

impl Task {
    pub fn new(id: &str, subject: &str) -> Self {
        Task {
            id: id.to_string(),
            subject: subject.to_string(),
            blocked_by: Vec::new(),
        }
    }

    pub fn with_blocked_by(mut self, deps: &[&str]) -> Self {
        self.blocked_by = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Assignment status as reported by the worker side. `Sent` is recorded
/// before the worker acknowledges start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Sent,
    InProgress,
    Completed,
    Failed,
}

impl AssignmentStatus {
    /// True while the assignment occupies a parallel-agent slot.
    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Sent | AssignmentStatus::InProgress)
    }
}

/// Binds a task to a worker identity and a worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub status: AssignmentStatus,
    pub worktree_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Critic rejection feedback, oldest first. Fed back into fix-up runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critic_feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskAssignment {
    pub fn new(task_id: &str, agent_id: &str) -> Self {
        TaskAssignment {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            status: AssignmentStatus::Sent,
            worktree_path: None,
            started_at: None,
            completed_at: None,
            error: None,
            critic_feedback: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Derived status of a graph node. Never persisted; recomputed on every
/// graph build from the task list plus the latest assignments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Blocked,
    Ready,
    Sent,
    InProgress,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Blocked => "blocked",
            NodeStatus::Ready => "ready",
            NodeStatus::Sent => "sent",
            NodeStatus::InProgress => "in_progress",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Filesystem lifecycle of one task's isolated working copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Cleaned,
}

/// Critic gate state for one worktree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CriticStatus {
    Pending,
    Reviewing,
    Approved,
    Rejected,
}

/// One isolated working copy, created per dispatched task and kept until
/// the task's branch or PR has been finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanWorktree {
    pub task_id: String,
    pub path: String,
    pub branch: String,
    pub status: WorktreeStatus,
    pub critic_status: CriticStatus,
    pub critic_iteration: u32,
    pub created_at: DateTime<Utc>,
}

/// One commit contributed by a task branch or loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub id: String,
    pub short_id: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
}

/// One pull request raised for a task branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrSummary {
    pub number: u32,
    pub url: String,
    pub branch: String,
    pub title: String,
}

/// Aggregate version-control output of a plan or loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitSummary {
    #[serde(default)]
    pub commits: Vec<CommitSummary>,
    #[serde(default)]
    pub pull_requests: Vec<PrSummary>,
}

impl GitSummary {
    /// Fold another summary into this one, skipping commits already present.
    pub fn merge(&mut self, other: GitSummary) {
        for commit in other.commits {
            if !self.commits.iter().any(|c| c.id == commit.id) {
                self.commits.push(commit);
            }
        }
        for pr in other.pull_requests {
            if !self.pull_requests.iter().any(|p| p.number == pr.number) {
                self.pull_requests.push(pr);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.pull_requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_status_roundtrip() {
        let statuses = [
            PlanStatus::Draft,
            PlanStatus::Discussing,
            PlanStatus::Discussed,
            PlanStatus::Delegating,
            PlanStatus::InProgress,
            PlanStatus::ReadyForReview,
            PlanStatus::Completed,
            PlanStatus::Failed,
            PlanStatus::Cancelled,
        ];
        for status in statuses {
            let parsed: PlanStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<PlanStatus>().is_err());
    }

    #[test]
    fn test_plan_status_predicates() {
        assert!(PlanStatus::Completed.is_terminal());
        assert!(PlanStatus::Failed.is_terminal());
        assert!(PlanStatus::Cancelled.is_terminal());
        assert!(!PlanStatus::InProgress.is_terminal());

        assert!(PlanStatus::Delegating.is_executing());
        assert!(PlanStatus::InProgress.is_executing());
        assert!(!PlanStatus::Draft.is_executing());
        assert!(!PlanStatus::ReadyForReview.is_executing());
    }

    #[test]
    fn test_assignment_starts_sent() {
        let assignment = TaskAssignment::new("task-1", "agent-1");
        assert_eq!(assignment.status, AssignmentStatus::Sent);
        assert!(assignment.status.is_active());
        assert!(assignment.started_at.is_none());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("b", "Build the thing").with_blocked_by(&["a"]);
        assert_eq!(task.id, "b");
        assert_eq!(task.blocked_by, vec!["a".to_string()]);
    }

    #[test]
    fn test_git_summary_merge_deduplicates() {
        let commit = CommitSummary {
            id: "abc123def".to_string(),
            short_id: "abc123d".to_string(),
            message: "Add parser".to_string(),
            author: "Test".to_string(),
            timestamp: 1_700_000_000,
        };
        let mut summary = GitSummary::default();
        summary.merge(GitSummary {
            commits: vec![commit.clone()],
            pull_requests: vec![],
        });
        summary.merge(GitSummary {
            commits: vec![commit],
            pull_requests: vec![],
        });
        assert_eq!(summary.commits.len(), 1);
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let plan = Plan::new("Test plan");
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("\"teamMode\""));
        assert!(json.contains("\"branchStrategy\""));
        assert!(json.contains("\"gitSummary\""));
        assert!(json.contains("\"top-down\""));
    }
}
