//! State for the iterative loop engine
//!
//! A loop re-sends one fixed prompt to an agent, iteration after iteration,
//! inside a single persistent worktree, until the agent's output contains
//! the completion promise or the iteration budget runs out. Everything here
//! is persisted after each transition so a loop survives process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentType;
use crate::models::{CommitSummary, GitSummary};

/// Lifecycle of a loop run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RalphLoopStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RalphLoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RalphLoopStatus::Idle => "idle",
            RalphLoopStatus::Running => "running",
            RalphLoopStatus::Paused => "paused",
            RalphLoopStatus::Completed => "completed",
            RalphLoopStatus::Failed => "failed",
            RalphLoopStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal loops accept no further iterations except an explicit retry
    /// after failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RalphLoopStatus::Completed | RalphLoopStatus::Failed | RalphLoopStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RalphLoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a single iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Pending => "pending",
            IterationStatus::Running => "running",
            IterationStatus::Completed => "completed",
            IterationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IterationStatus::Completed | IterationStatus::Failed)
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Loop configuration, immutable once the loop starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphLoopConfig {
    /// Workspace or tab this loop belongs to.
    pub workspace_id: String,

    /// Repository the loop's worktree is created from.
    pub project_path: String,

    /// Prompt re-sent verbatim at the start of every iteration.
    pub prompt: String,

    #[serde(default)]
    pub agent_type: AgentType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Exact, case-sensitive substring that signals completion.
    #[serde(default = "default_completion_promise")]
    pub completion_promise: String,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    50
}

fn default_completion_promise() -> String {
    "<promise>COMPLETE</promise>".to_string()
}

impl RalphLoopConfig {
    pub fn new(
        workspace_id: impl Into<String>,
        project_path: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            project_path: project_path.into(),
            prompt: prompt.into(),
            agent_type: AgentType::default(),
            model: None,
            completion_promise: default_completion_promise(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// One agent run against the loop prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphLoopIteration {
    /// 1-based position in the loop.
    pub iteration_number: u32,

    /// Agent that ran this iteration, once dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    pub status: IterationStatus,

    /// Buffered agent output. Scanned once, after the iteration ends, for
    /// the completion promise.
    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub promise_detected: bool,

    /// Commits this iteration added to the loop branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<CommitSummary>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RalphLoopIteration {
    pub fn new(iteration_number: u32) -> Self {
        Self {
            iteration_number,
            agent_id: None,
            status: IterationStatus::Pending,
            output: String::new(),
            promise_detected: false,
            commits: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Full persisted state of one loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphLoopState {
    pub id: String,
    pub status: RalphLoopStatus,

    /// Number of the iteration currently running or last finished.
    /// Zero until the first iteration starts.
    pub current_iteration: u32,

    pub iterations: Vec<RalphLoopIteration>,

    /// Persistent worktree shared by every iteration of this loop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Commits accumulated across all iterations.
    #[serde(default)]
    pub git_summary: GitSummary,

    pub config: RalphLoopConfig,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RalphLoopState {
    pub fn new(config: RalphLoopConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: RalphLoopStatus::Idle,
            current_iteration: 0,
            iterations: Vec::new(),
            worktree_path: None,
            branch: None,
            git_summary: GitSummary::default(),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn iteration(&self, number: u32) -> Option<&RalphLoopIteration> {
        self.iterations
            .iter()
            .find(|i| i.iteration_number == number)
    }

    pub fn iteration_mut(&mut self, number: u32) -> Option<&mut RalphLoopIteration> {
        self.iterations
            .iter_mut()
            .find(|i| i.iteration_number == number)
    }

    /// Append the next iteration and make it current. Returns its number.
    pub fn begin_iteration(&mut self) -> u32 {
        let number = self.iterations.len() as u32 + 1;
        self.iterations.push(RalphLoopIteration::new(number));
        self.current_iteration = number;
        self.updated_at = Utc::now();
        number
    }

    /// True once any iteration has produced the completion promise.
    pub fn promise_detected(&self) -> bool {
        self.iterations.iter().any(|i| i.promise_detected)
    }

    pub fn completed_iterations(&self) -> usize {
        self.iterations
            .iter()
            .filter(|i| i.status == IterationStatus::Completed)
            .count()
    }
}
