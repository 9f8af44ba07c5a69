// Event types and the broadcast fan-out bus
// Consumers (UI bridges) subscribe; the engine never blocks on delivery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::models::{CriticStatus, NodeStatus, PlanStatus, WorktreeStatus};
use crate::ralph_loop::{IterationStatus, RalphLoopStatus};

// Event name constants
pub const EVENT_PLAN_STATUS_CHANGED: &str = "plan:status_changed";
pub const EVENT_TASK_STATUS_CHANGED: &str = "task:status_changed";
pub const EVENT_ASSIGNMENT_DISPATCHED: &str = "assignment:dispatched";
pub const EVENT_WORKTREE_STATUS_CHANGED: &str = "worktree:status_changed";
pub const EVENT_CRITIC_STATUS_CHANGED: &str = "critic:status_changed";
pub const EVENT_LOOP_STATUS_CHANGED: &str = "loop:status_changed";
pub const EVENT_LOOP_ITERATION_CHANGED: &str = "loop:iteration_changed";
pub const EVENT_AGENT_OUTPUT: &str = "agent:output";

/// A state transition or output notification emitted by the engine.
///
/// Transition events are persisted to the event log before emission;
/// `AgentOutput` is fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    PlanStatusChanged {
        plan_id: String,
        old_status: PlanStatus,
        new_status: PlanStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    TaskStatusChanged {
        plan_id: String,
        task_id: String,
        old_status: Option<NodeStatus>,
        new_status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    AssignmentDispatched {
        plan_id: String,
        task_id: String,
        assignment_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    WorktreeStatusChanged {
        plan_id: String,
        task_id: String,
        path: String,
        new_status: WorktreeStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    CriticStatusChanged {
        plan_id: String,
        task_id: String,
        old_status: CriticStatus,
        new_status: CriticStatus,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    LoopStatusChanged {
        loop_id: String,
        old_status: RalphLoopStatus,
        new_status: RalphLoopStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    LoopIterationChanged {
        loop_id: String,
        iteration: u32,
        old_status: Option<IterationStatus>,
        new_status: IterationStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    AgentOutput {
        scope_id: String,
        task_id: Option<String>,
        iteration: Option<u32>,
        chunk: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The channel-style name consumers key on.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PlanStatusChanged { .. } => EVENT_PLAN_STATUS_CHANGED,
            EngineEvent::TaskStatusChanged { .. } => EVENT_TASK_STATUS_CHANGED,
            EngineEvent::AssignmentDispatched { .. } => EVENT_ASSIGNMENT_DISPATCHED,
            EngineEvent::WorktreeStatusChanged { .. } => EVENT_WORKTREE_STATUS_CHANGED,
            EngineEvent::CriticStatusChanged { .. } => EVENT_CRITIC_STATUS_CHANGED,
            EngineEvent::LoopStatusChanged { .. } => EVENT_LOOP_STATUS_CHANGED,
            EngineEvent::LoopIterationChanged { .. } => EVENT_LOOP_ITERATION_CHANGED,
            EngineEvent::AgentOutput { .. } => EVENT_AGENT_OUTPUT,
        }
    }

    /// True for transition events that are persisted for replay.
    pub fn is_transition(&self) -> bool {
        !matches!(self, EngineEvent::AgentOutput { .. })
    }

    pub fn plan_status_changed(plan_id: &str, old: PlanStatus, new: PlanStatus) -> Self {
        EngineEvent::PlanStatusChanged {
            plan_id: plan_id.to_string(),
            old_status: old,
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    pub fn task_status_changed(
        plan_id: &str,
        task_id: &str,
        old: Option<NodeStatus>,
        new: NodeStatus,
    ) -> Self {
        EngineEvent::TaskStatusChanged {
            plan_id: plan_id.to_string(),
            task_id: task_id.to_string(),
            old_status: old,
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    pub fn assignment_dispatched(
        plan_id: &str,
        task_id: &str,
        assignment_id: &str,
        agent_id: &str,
    ) -> Self {
        EngineEvent::AssignmentDispatched {
            plan_id: plan_id.to_string(),
            task_id: task_id.to_string(),
            assignment_id: assignment_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn worktree_status_changed(
        plan_id: &str,
        task_id: &str,
        path: &str,
        new: WorktreeStatus,
    ) -> Self {
        EngineEvent::WorktreeStatusChanged {
            plan_id: plan_id.to_string(),
            task_id: task_id.to_string(),
            path: path.to_string(),
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    pub fn critic_status_changed(
        plan_id: &str,
        task_id: &str,
        old: CriticStatus,
        new: CriticStatus,
        iteration: u32,
    ) -> Self {
        EngineEvent::CriticStatusChanged {
            plan_id: plan_id.to_string(),
            task_id: task_id.to_string(),
            old_status: old,
            new_status: new,
            iteration,
            timestamp: Utc::now(),
        }
    }

    pub fn loop_status_changed(loop_id: &str, old: RalphLoopStatus, new: RalphLoopStatus) -> Self {
        EngineEvent::LoopStatusChanged {
            loop_id: loop_id.to_string(),
            old_status: old,
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    pub fn loop_iteration_changed(
        loop_id: &str,
        iteration: u32,
        old: Option<IterationStatus>,
        new: IterationStatus,
    ) -> Self {
        EngineEvent::LoopIterationChanged {
            loop_id: loop_id.to_string(),
            iteration,
            old_status: old,
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    pub fn agent_output(scope_id: &str, task_id: Option<&str>, iteration: Option<u32>, chunk: &str) -> Self {
        EngineEvent::AgentOutput {
            scope_id: scope_id.to_string(),
            task_id: task_id.map(|t| t.to_string()),
            iteration,
            chunk: chunk.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Default broadcast capacity. Slow subscribers that fall more than this
/// many events behind see a Lagged error and miss the oldest entries.
const DEFAULT_CAPACITY: usize = 4096;

/// Push-only fan-out channel. Emission never blocks: with no subscribers
/// the event is dropped, and lagging subscribers lose oldest events rather
/// than stalling the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit an event to all current subscribers. A send error only means
    /// there are no receivers, which is fine.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
