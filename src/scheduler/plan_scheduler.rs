use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::agents::{AgentEvent, AgentHandle, AgentRunner, DispatchRequest};
use crate::config::EngineConfig;
use crate::critic::{self, CriticVerdict};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::graph::{self, DependencyGraph};
use crate::models::{
    state_machine, AssignmentStatus, CriticStatus, GitSummary, NodeStatus, Plan, PlanStatus, Task,
    TaskAssignment, WorktreeStatus,
};
use crate::storage::{EventLog, PlanRecord, PlanStore, Storage};
use crate::utils::generate_id;
use crate::worktree::WorktreeManager;

/// Commands accepted by a running plan scheduler. User-facing commands and
/// forwarded agent events share one queue, which is what serializes them.
pub enum PlanCommand {
    /// Open the discussion phase (draft -> discussing)
    Discuss,
    /// Close the discussion phase (discussing -> discussed)
    ConcludeDiscussion,
    /// Begin delegating tasks to agents (discussed -> delegating)
    StartExecution,
    /// Event from a worker agent, tagged with the task it serves
    AgentEvent { task_id: String, event: AgentEvent },
    /// Event from a critic agent reviewing a task
    CriticEvent { task_id: String, event: AgentEvent },
    /// Cooperatively stop all running agents, then cancel the plan
    Cancel,
    /// Internal: the cancellation grace period elapsed. The generation ties
    /// the expiry to the cancel that armed it; expiries from earlier
    /// cancellations are ignored.
    CancelGraceExpired { generation: u64 },
    /// Reset a failed or cancelled plan back to delegating
    Restart,
    /// Accept a plan in ready_for_review as completed
    Complete,
    /// Snapshot of scheduler state for inspection
    GetStats { reply: oneshot::Sender<SchedulerStats> },
    /// Stop the scheduler task without touching plan state
    Shutdown,
}

/// Point-in-time view of a scheduler, answered without mutating anything.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub plan_id: String,
    pub plan_status: PlanStatus,
    pub total_tasks: usize,
    pub blocked: usize,
    pub ready: usize,
    pub sent: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub active_agents: usize,
    pub reviews_in_flight: usize,
    pub critic_iterations: u32,
    pub max_parallel_agents: u32,
}

/// Cloneable sender half for a spawned scheduler.
#[derive(Clone)]
pub struct PlanSchedulerHandle {
    plan_id: String,
    tx: mpsc::UnboundedSender<PlanCommand>,
}

impl PlanSchedulerHandle {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Returns false once the scheduler task has exited.
    pub fn send(&self, command: PlanCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub async fn stats(&self) -> Option<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(PlanCommand::GetStats { reply }) {
            return None;
        }
        rx.await.ok()
    }
}

/// Prompt handed to a worker agent when its task is dispatched.
pub fn build_task_prompt(task: &Task, completed_dependencies: &[Task]) -> String {
    let context = if completed_dependencies.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = completed_dependencies
            .iter()
            .map(|dep| format!("- {} (`{}`)", dep.subject, dep.id))
            .collect();
        format!(
            "\n## Completed Dependencies\n\nThis task builds on work that is already done:\n\n{}\n",
            lines.join("\n")
        )
    };

    format!(
        r#"# Task

{subject}

Task id: `{id}`
{context}
## Instructions

1. Work only inside this worktree
2. Implement the task described above completely
3. Run existing tests if the project has them
4. Commit your changes with clear messages when you are done
"#,
        subject = task.subject,
        id = task.id,
        context = context,
    )
}

struct ReviewState {
    agent_id: String,
    output: String,
}

/// Single-owner reactive loop for one plan. All mutation happens on the
/// scheduler's own task; the outside world only holds a [`PlanSchedulerHandle`].
pub struct PlanScheduler {
    plan: Plan,
    tasks: Vec<Task>,
    assignments: HashMap<String, TaskAssignment>,
    graph: DependencyGraph,
    runner: Arc<dyn AgentRunner>,
    worktree: WorktreeManager,
    store: PlanStore,
    event_log: EventLog,
    bus: EventBus,
    config: EngineConfig,
    rx: mpsc::UnboundedReceiver<PlanCommand>,
    self_tx: mpsc::UnboundedSender<PlanCommand>,
    prev_statuses: HashMap<String, NodeStatus>,
    reviews: HashMap<String, ReviewState>,
    pending_events: Vec<EngineEvent>,
    cancelling: bool,
    cancel_generation: u64,
    fatal: bool,
}

impl PlanScheduler {
    /// Validates the task graph, prepares storage and worktree management for
    /// the plan, and spawns the scheduler task.
    pub fn spawn(
        plan: Plan,
        tasks: Vec<Task>,
        runner: Arc<dyn AgentRunner>,
        project_path: &Path,
        config: EngineConfig,
        bus: EventBus,
    ) -> Result<PlanSchedulerHandle, EngineError> {
        let graph = graph::build(&tasks, &[])?;
        let storage = Storage::init(project_path).map_err(EngineError::persistence)?;
        let worktree = WorktreeManager::new(&plan.id, project_path, &config)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PlanSchedulerHandle {
            plan_id: plan.id.clone(),
            tx: tx.clone(),
        };

        let scheduler = PlanScheduler {
            plan,
            tasks,
            assignments: HashMap::new(),
            graph,
            runner,
            worktree,
            store: storage.plans,
            event_log: storage.events,
            bus,
            config,
            rx,
            self_tx: tx,
            prev_statuses: HashMap::new(),
            reviews: HashMap::new(),
            pending_events: Vec::new(),
            cancelling: false,
            cancel_generation: 0,
            fatal: false,
        };

        tokio::spawn(scheduler.run());
        Ok(handle)
    }

    async fn run(mut self) {
        log::info!(
            "[Scheduler] Plan {} started with {} tasks",
            self.plan.id,
            self.tasks.len()
        );
        self.flush();

        while let Some(command) = self.rx.recv().await {
            if !self.apply(command).await {
                break;
            }
        }

        log::info!("[Scheduler] Plan {} scheduler stopped", self.plan.id);
    }

    /// Applies one command. Returns false when the loop should exit.
    async fn apply(&mut self, command: PlanCommand) -> bool {
        let state_changed = match command {
            PlanCommand::Shutdown => {
                log::info!("[Scheduler] Plan {} shutting down", self.plan.id);
                return false;
            }
            PlanCommand::GetStats { reply } => {
                let _ = reply.send(self.stats());
                false
            }
            PlanCommand::Discuss => self.set_plan_status(PlanStatus::Discussing),
            PlanCommand::ConcludeDiscussion => self.set_plan_status(PlanStatus::Discussed),
            PlanCommand::StartExecution => self.set_plan_status(PlanStatus::Delegating),
            PlanCommand::AgentEvent { task_id, event } => self.on_worker_event(&task_id, event),
            PlanCommand::CriticEvent { task_id, event } => {
                self.on_critic_event(&task_id, event).await
            }
            PlanCommand::Cancel => self.on_cancel(),
            PlanCommand::CancelGraceExpired { generation } => self.on_grace_expired(generation),
            PlanCommand::Restart => self.on_restart(),
            PlanCommand::Complete => self.on_complete(),
        };

        if state_changed {
            self.cycle();
        }
        !self.fatal
    }

    /// The reactive core: recompute the graph, finish a drained cancellation,
    /// fill free agent slots, evaluate terminal conditions, then persist and
    /// publish whatever changed.
    fn cycle(&mut self) {
        if self.fatal {
            return;
        }
        self.rebuild_graph();

        if self.cancelling && self.active_assignments() == 0 {
            self.finish_cancel();
        }

        if !self.cancelling && self.plan.status.is_executing() {
            self.dispatch_ready();
            if self.plan.status == PlanStatus::Delegating && self.active_assignments() > 0 {
                self.set_plan_status(PlanStatus::InProgress);
            }
            self.evaluate_terminal();
        }

        self.collect_task_status_events();
        self.flush();
    }

    fn rebuild_graph(&mut self) {
        let assignments: Vec<TaskAssignment> = self.assignments.values().cloned().collect();
        match graph::build(&self.tasks, &assignments) {
            Ok(graph) => self.graph = graph,
            // Tasks are validated at spawn and immutable afterwards, so a
            // rebuild failure means corrupted state. Fail the plan visibly.
            Err(e) => {
                log::error!("[Scheduler] Plan {} graph rebuild failed: {}", self.plan.id, e);
                self.set_plan_status(PlanStatus::Failed);
            }
        }
    }

    /// Fills free slots with ready tasks, critical-path nodes first, then
    /// lowest task id. Rebuilds after every dispatch so one pass drains
    /// everything dispatchable.
    fn dispatch_ready(&mut self) {
        loop {
            if self.active_assignments() >= self.config.execution.max_parallel_agents as usize {
                break;
            }
            let candidate = {
                let ready = self.graph.ready_nodes();
                ready
                    .iter()
                    .find(|node| self.graph.is_on_critical_path(&node.task_id))
                    .or_else(|| ready.first())
                    .map(|node| node.task_id.clone())
            };
            let Some(task_id) = candidate else {
                break;
            };
            self.dispatch_task(&task_id);
            self.rebuild_graph();
        }
    }

    fn dispatch_task(&mut self, task_id: &str) {
        let Some(task) = self.tasks.iter().find(|t| t.id == task_id).cloned() else {
            log::error!("[Scheduler] Cannot dispatch unknown task {}", task_id);
            return;
        };

        let agent_id = generate_id();
        let mut assignment = TaskAssignment::new(task_id, &agent_id);

        let worktree_path = match self.worktree.acquire(task_id) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(e) => {
                log::error!(
                    "[Scheduler] Worktree acquire failed for task {}: {}",
                    task_id,
                    e
                );
                assignment.status = AssignmentStatus::Failed;
                assignment.error = Some(e.to_string());
                assignment.completed_at = Some(Utc::now());
                self.assignments.insert(task_id.to_string(), assignment);
                return;
            }
        };
        self.pending_events.push(EngineEvent::worktree_status_changed(
            &self.plan.id,
            task_id,
            &worktree_path,
            WorktreeStatus::Active,
        ));
        assignment.worktree_path = Some(worktree_path.clone());

        let dependencies: Vec<Task> = task
            .blocked_by
            .iter()
            .filter_map(|dep| self.tasks.iter().find(|t| t.id == *dep))
            .cloned()
            .collect();
        let request = DispatchRequest {
            agent_id: agent_id.clone(),
            agent_type: self.config.execution.agent_type,
            model: self.config.execution.model.clone(),
            prompt: build_task_prompt(&task, &dependencies),
            working_dir: worktree_path,
        };

        match self.runner.dispatch(request) {
            Ok(handle) => {
                log::info!("[Scheduler] Dispatched task {} to agent {}", task_id, agent_id);
                self.pending_events.push(EngineEvent::assignment_dispatched(
                    &self.plan.id,
                    task_id,
                    &assignment.id,
                    &agent_id,
                ));
                self.assignments.insert(task_id.to_string(), assignment);
                self.spawn_forwarder(task_id, handle, false);
            }
            Err(e) => {
                log::error!("[Scheduler] Dispatch failed for task {}: {}", task_id, e);
                assignment.status = AssignmentStatus::Failed;
                assignment.error = Some(e.to_string());
                assignment.completed_at = Some(Utc::now());
                self.assignments.insert(task_id.to_string(), assignment);
                self.release_worktree(task_id);
            }
        }
    }

    /// Pumps one agent's event stream into the command queue. A stream that
    /// ends without a terminal event is reported as a failure so the task
    /// cannot hang forever.
    fn spawn_forwarder(&self, task_id: &str, mut handle: AgentHandle, critic: bool) {
        let tx = self.self_tx.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut terminal_seen = false;
            while let Some(event) = handle.events.recv().await {
                let is_terminal = event.is_terminal();
                let command = if critic {
                    PlanCommand::CriticEvent {
                        task_id: task_id.clone(),
                        event,
                    }
                } else {
                    PlanCommand::AgentEvent {
                        task_id: task_id.clone(),
                        event,
                    }
                };
                if tx.send(command).is_err() {
                    return;
                }
                if is_terminal {
                    terminal_seen = true;
                    break;
                }
            }
            if !terminal_seen {
                let event = AgentEvent::Failed {
                    error: "agent event stream ended without a terminal event".to_string(),
                };
                let command = if critic {
                    PlanCommand::CriticEvent { task_id, event }
                } else {
                    PlanCommand::AgentEvent { task_id, event }
                };
                let _ = tx.send(command);
            }
        });
    }

    fn on_worker_event(&mut self, task_id: &str, event: AgentEvent) -> bool {
        if self.plan.status.is_terminal() {
            log::debug!(
                "[Scheduler] Ignoring worker event for task {} on terminal plan",
                task_id
            );
            return false;
        }
        let Some(status) = self.assignments.get(task_id).map(|a| a.status) else {
            log::debug!("[Scheduler] Worker event for unassigned task {}", task_id);
            return false;
        };
        if !status.is_active() {
            log::debug!(
                "[Scheduler] Ignoring worker event for finalized task {}",
                task_id
            );
            return false;
        }

        match event {
            AgentEvent::Started => {
                if let Some(assignment) = self.assignments.get_mut(task_id) {
                    if assignment.status == AssignmentStatus::Sent {
                        assignment.status = AssignmentStatus::InProgress;
                        assignment.started_at = Some(Utc::now());
                        return true;
                    }
                }
                false
            }
            AgentEvent::OutputChunk { content } => {
                self.bus.emit(EngineEvent::agent_output(
                    &self.plan.id,
                    Some(task_id),
                    None,
                    &content,
                ));
                false
            }
            AgentEvent::Completed { .. } => {
                if self.cancelling {
                    self.fail_task(task_id, "stopped by plan cancellation");
                    return true;
                }
                self.start_review(task_id)
            }
            AgentEvent::Failed { error } => {
                if self.cancelling {
                    self.fail_task(task_id, "stopped by plan cancellation");
                    return true;
                }
                let failure = EngineError::AgentFailure {
                    task_id: task_id.to_string(),
                    message: error,
                };
                self.fail_task(task_id, &failure.to_string());
                true
            }
        }
    }

    /// Worker reported completion: gate it behind a critic pass before the
    /// graph may count the task as completed.
    fn start_review(&mut self, task_id: &str) -> bool {
        let Some(task) = self.tasks.iter().find(|t| t.id == task_id).cloned() else {
            log::error!("[Scheduler] Review requested for unknown task {}", task_id);
            return false;
        };
        let Some(worktree_path) = self.worktree.record(task_id).map(|r| r.path.clone()) else {
            self.fail_task(task_id, "no worktree to review");
            return true;
        };
        let old_status = self
            .worktree
            .record(task_id)
            .map(|r| r.critic_status)
            .unwrap_or(CriticStatus::Pending);

        let attempt = match self.worktree.begin_review(task_id) {
            Ok(attempt) => attempt,
            Err(e) => {
                self.fail_task(task_id, &e.to_string());
                return true;
            }
        };
        self.pending_events.push(EngineEvent::critic_status_changed(
            &self.plan.id,
            task_id,
            old_status,
            CriticStatus::Reviewing,
            attempt - 1,
        ));

        let feedback = self
            .assignments
            .get(task_id)
            .map(|a| a.critic_feedback.clone())
            .unwrap_or_default();
        let agent_id = generate_id();
        let request = DispatchRequest {
            agent_id: agent_id.clone(),
            agent_type: self.config.execution.agent_type,
            model: self.config.execution.model.clone(),
            prompt: critic::build_review_prompt(&task, attempt, &feedback, &self.config.critic),
            working_dir: worktree_path,
        };

        log::info!(
            "[Scheduler] Dispatching critic for task {} (review round {})",
            task_id,
            attempt
        );
        match self.runner.dispatch(request) {
            Ok(handle) => {
                self.reviews.insert(
                    task_id.to_string(),
                    ReviewState {
                        agent_id,
                        output: String::new(),
                    },
                );
                self.spawn_forwarder(task_id, handle, true);
                true
            }
            Err(e) => {
                log::error!("[Scheduler] Critic dispatch failed for task {}: {}", task_id, e);
                self.on_review_rejection(task_id, format!("Critic dispatch failed: {}", e))
            }
        }
    }

    async fn on_critic_event(&mut self, task_id: &str, event: AgentEvent) -> bool {
        if self.plan.status.is_terminal() {
            return false;
        }
        if !self.reviews.contains_key(task_id) {
            log::debug!(
                "[Scheduler] Ignoring critic event for task {} without an active review",
                task_id
            );
            return false;
        }

        match event {
            AgentEvent::Started => false,
            AgentEvent::OutputChunk { content } => {
                if let Some(review) = self.reviews.get_mut(task_id) {
                    review.output.push_str(&content);
                }
                self.bus.emit(EngineEvent::agent_output(
                    &self.plan.id,
                    Some(task_id),
                    None,
                    &content,
                ));
                false
            }
            AgentEvent::Completed { message } => {
                let mut output = self
                    .reviews
                    .remove(task_id)
                    .map(|r| r.output)
                    .unwrap_or_default();
                output.push_str(&message);
                if self.cancelling {
                    self.fail_task(task_id, "stopped by plan cancellation");
                    return true;
                }
                match critic::parse_verdict(&output, &self.config.critic) {
                    Some(CriticVerdict::Approved) => self.on_review_approved(task_id).await,
                    Some(CriticVerdict::Rejected) => self.on_review_rejection(task_id, output),
                    None => {
                        log::warn!(
                            "[Scheduler] Critic for task {} gave no verdict, counting as rejection",
                            task_id
                        );
                        self.on_review_rejection(task_id, output)
                    }
                }
            }
            AgentEvent::Failed { error } => {
                self.reviews.remove(task_id);
                if self.cancelling {
                    self.fail_task(task_id, "stopped by plan cancellation");
                    return true;
                }
                log::warn!("[Scheduler] Critic run for task {} failed: {}", task_id, error);
                self.on_review_rejection(
                    task_id,
                    format!("Critic run failed before producing a verdict: {}", error),
                )
            }
        }
    }

    async fn on_review_approved(&mut self, task_id: &str) -> bool {
        if let Err(e) = self.worktree.record_approval(task_id) {
            self.fail_task(task_id, &e.to_string());
            return true;
        }
        let iteration = self
            .worktree
            .record(task_id)
            .map(|r| r.critic_iteration)
            .unwrap_or(0);
        self.pending_events.push(EngineEvent::critic_status_changed(
            &self.plan.id,
            task_id,
            CriticStatus::Reviewing,
            CriticStatus::Approved,
            iteration,
        ));

        let Some(task) = self.tasks.iter().find(|t| t.id == task_id).cloned() else {
            self.fail_task(task_id, "task record missing at finalize");
            return true;
        };
        log::info!("[Scheduler] Critic approved task {}", task_id);

        match self.worktree.finalize(&task, self.plan.branch_strategy).await {
            Ok(summary) => {
                self.plan.git_summary.merge(summary);
                self.release_worktree(task_id);
                if let Some(assignment) = self.assignments.get_mut(task_id) {
                    assignment.status = AssignmentStatus::Completed;
                    assignment.completed_at = Some(Utc::now());
                }
                log::info!("[Scheduler] Task {} finalized and completed", task_id);
            }
            Err(e) => {
                self.fail_task(task_id, &format!("Finalize failed: {}", e));
            }
        }
        true
    }

    /// Records a rejection and either hands the worktree back to the original
    /// worker with the critic's feedback, or fails the task once the fix-up
    /// budget is spent.
    fn on_review_rejection(&mut self, task_id: &str, feedback: String) -> bool {
        let count = match self.worktree.record_rejection(task_id) {
            Ok(count) => count,
            Err(e) => {
                self.fail_task(task_id, &e.to_string());
                return true;
            }
        };
        self.pending_events.push(EngineEvent::critic_status_changed(
            &self.plan.id,
            task_id,
            CriticStatus::Reviewing,
            CriticStatus::Rejected,
            count,
        ));
        if let Some(assignment) = self.assignments.get_mut(task_id) {
            assignment.critic_feedback.push(feedback);
        }

        let max = self.config.critic.max_iterations;
        if count > max {
            let exhausted = EngineError::CriticIterationExhausted {
                task_id: task_id.to_string(),
                max_iterations: max,
            };
            log::warn!("[Scheduler] {}", exhausted);
            self.fail_task(task_id, &exhausted.to_string());
            return true;
        }

        let Some(task) = self.tasks.iter().find(|t| t.id == task_id).cloned() else {
            self.fail_task(task_id, "task record missing at fix-up");
            return true;
        };
        let (agent_id, worktree_path, history) =
            match (self.assignments.get(task_id), self.worktree.record(task_id)) {
                (Some(assignment), Some(record)) => (
                    assignment.agent_id.clone(),
                    record.path.clone(),
                    assignment.critic_feedback.clone(),
                ),
                _ => {
                    self.fail_task(task_id, "assignment state missing at fix-up");
                    return true;
                }
            };

        log::info!(
            "[Scheduler] Redispatching task {} for fix-up (rejection {} of {})",
            task_id,
            count,
            max
        );
        let request = DispatchRequest {
            agent_id,
            agent_type: self.config.execution.agent_type,
            model: self.config.execution.model.clone(),
            prompt: critic::build_fixup_prompt(&task, &history),
            working_dir: worktree_path,
        };
        match self.runner.dispatch(request) {
            Ok(handle) => self.spawn_forwarder(task_id, handle, false),
            Err(e) => self.fail_task(task_id, &format!("Fix-up dispatch failed: {}", e)),
        }
        true
    }

    fn fail_task(&mut self, task_id: &str, error: &str) {
        log::warn!("[Scheduler] Task {} failed: {}", task_id, error);
        if let Some(assignment) = self.assignments.get_mut(task_id) {
            assignment.status = AssignmentStatus::Failed;
            assignment.error = Some(error.to_string());
            assignment.completed_at = Some(Utc::now());
        }
        self.reviews.remove(task_id);
        self.worktree.abort_review(task_id);
        self.release_worktree(task_id);
    }

    fn release_worktree(&mut self, task_id: &str) {
        let pre = self
            .worktree
            .record(task_id)
            .map(|r| (r.path.clone(), r.status));
        match self.worktree.release(task_id) {
            Ok(()) => {
                if let Some((path, WorktreeStatus::Active)) = pre {
                    self.pending_events.push(EngineEvent::worktree_status_changed(
                        &self.plan.id,
                        task_id,
                        &path,
                        WorktreeStatus::Cleaned,
                    ));
                }
            }
            Err(e) => {
                log::warn!(
                    "[Scheduler] Worktree release failed for task {}: {}",
                    task_id,
                    e
                );
            }
        }
    }

    fn on_cancel(&mut self) -> bool {
        if self.cancelling {
            log::warn!("[Scheduler] Plan {} is already cancelling", self.plan.id);
            return false;
        }
        if !state_machine::can_transition(self.plan.status, PlanStatus::Cancelled) {
            log::warn!(
                "[Scheduler] Ignoring cancel for plan {} in status {}",
                self.plan.id,
                self.plan.status
            );
            return false;
        }

        log::info!("[Scheduler] Cancelling plan {}", self.plan.id);
        self.cancelling = true;
        self.cancel_generation += 1;

        let mut agent_ids: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.status.is_active())
            .map(|a| a.agent_id.clone())
            .collect();
        agent_ids.extend(self.reviews.values().map(|r| r.agent_id.clone()));
        for agent_id in &agent_ids {
            self.runner.stop(agent_id);
        }

        if self.active_assignments() == 0 {
            self.finish_cancel();
        } else {
            let grace = self.config.execution.cancel_grace_secs;
            log::info!(
                "[Scheduler] Waiting up to {}s for {} agents to stop",
                grace,
                agent_ids.len()
            );
            let generation = self.cancel_generation;
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(grace)).await;
                let _ = tx.send(PlanCommand::CancelGraceExpired { generation });
            });
        }
        true
    }

    /// Grace period elapsed. Any assignment still active is force-finalized
    /// as failed so cancellation always makes forward progress.
    fn on_grace_expired(&mut self, generation: u64) -> bool {
        if !self.cancelling || generation != self.cancel_generation {
            log::debug!("[Scheduler] Stale cancel grace expiry, ignoring");
            return false;
        }
        let survivors: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.status.is_active())
            .map(|a| a.task_id.clone())
            .collect();
        let grace = self.config.execution.cancel_grace_secs;
        for task_id in survivors {
            let timeout = EngineError::TimeoutOnCancel {
                task_id: task_id.clone(),
                grace_secs: grace,
            };
            log::warn!("[Scheduler] {}", timeout);
            self.fail_task(&task_id, "stop not acknowledged within the cancellation grace period");
        }
        self.finish_cancel();
        true
    }

    fn finish_cancel(&mut self) {
        self.reviews.clear();
        self.worktree.release_all();
        self.cancelling = false;
        self.set_plan_status(PlanStatus::Cancelled);
    }

    /// Wipes all execution state and puts the plan back into delegating.
    /// Only meaningful from a terminal failed/cancelled state.
    fn on_restart(&mut self) -> bool {
        if !state_machine::can_transition(self.plan.status, PlanStatus::Delegating) {
            log::warn!(
                "[Scheduler] Ignoring restart for plan {} in status {}",
                self.plan.id,
                self.plan.status
            );
            return false;
        }
        log::info!("[Scheduler] Restarting plan {}", self.plan.id);
        self.reviews.clear();
        if let Err(e) = self.worktree.reset() {
            log::error!("[Scheduler] Restart aborted, worktree reset failed: {}", e);
            return false;
        }
        self.assignments.clear();
        self.plan.git_summary = GitSummary::default();
        self.cancelling = false;
        self.set_plan_status(PlanStatus::Delegating);
        true
    }

    fn on_complete(&mut self) -> bool {
        if self.plan.status != PlanStatus::ReadyForReview {
            log::warn!(
                "[Scheduler] Ignoring complete for plan {} in status {}",
                self.plan.id,
                self.plan.status
            );
            return false;
        }
        self.set_plan_status(PlanStatus::Completed)
    }

    fn evaluate_terminal(&mut self) {
        if self.graph.is_complete() {
            self.set_plan_status(PlanStatus::ReadyForReview);
        } else if self.graph.has_failures() && !self.graph.dispatchable_exists() {
            log::warn!(
                "[Scheduler] Plan {} has failed tasks and nothing left to dispatch",
                self.plan.id
            );
            self.set_plan_status(PlanStatus::Failed);
        }
    }

    fn set_plan_status(&mut self, target: PlanStatus) -> bool {
        if self.plan.status == target {
            return false;
        }
        match state_machine::transition_plan(self.plan.status, target) {
            Ok(next) => {
                let old = self.plan.status;
                self.plan.status = next;
                self.plan.updated_at = Utc::now();
                log::info!("[Scheduler] Plan {}: {} -> {}", self.plan.id, old, next);
                self.pending_events
                    .push(EngineEvent::plan_status_changed(&self.plan.id, old, next));
                true
            }
            Err(e) => {
                log::warn!("[Scheduler] {}", e);
                false
            }
        }
    }

    /// Diffs node statuses against the previous cycle and queues one event
    /// per task that moved.
    fn collect_task_status_events(&mut self) {
        let mut nodes: Vec<_> = self.graph.nodes().collect();
        nodes.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut current = HashMap::with_capacity(nodes.len());
        for node in nodes {
            current.insert(node.task_id.clone(), node.status);
            let old = self.prev_statuses.get(&node.task_id).copied();
            if old != Some(node.status) {
                self.pending_events.push(EngineEvent::task_status_changed(
                    &self.plan.id,
                    &node.task_id,
                    old,
                    node.status,
                ));
            }
        }
        self.prev_statuses = current;
    }

    /// Durability barrier: the plan record is written before any queued event
    /// is published. A persistence failure is plan-fatal.
    fn flush(&mut self) {
        if let Err(e) = self.persist() {
            log::error!("[Scheduler] Plan {} persistence failed: {}", self.plan.id, e);
            let old = self.plan.status;
            self.plan.status = PlanStatus::Failed;
            self.fatal = true;
            self.pending_events.clear();
            self.bus.emit(EngineEvent::plan_status_changed(
                &self.plan.id,
                old,
                PlanStatus::Failed,
            ));
            return;
        }
        for event in std::mem::take(&mut self.pending_events) {
            if event.is_transition() {
                if let Err(e) = self.event_log.append(&self.plan.id, &event) {
                    log::warn!("[Scheduler] Event log append failed: {}", e);
                }
            }
            self.bus.emit(event);
        }
    }

    fn persist(&mut self) -> Result<(), EngineError> {
        self.plan.worktrees = self.worktree.records();
        let mut assignments: Vec<TaskAssignment> = self.assignments.values().cloned().collect();
        assignments.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let record = PlanRecord {
            plan: self.plan.clone(),
            tasks: self.tasks.clone(),
            assignments,
        };
        self.store.save(&record).map_err(EngineError::persistence)
    }

    fn active_assignments(&self) -> usize {
        self.assignments
            .values()
            .filter(|a| a.status.is_active())
            .count()
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            plan_id: self.plan.id.clone(),
            plan_status: self.plan.status,
            total_tasks: self.graph.len(),
            blocked: self.graph.count(NodeStatus::Blocked),
            ready: self.graph.count(NodeStatus::Ready),
            sent: self.graph.count(NodeStatus::Sent),
            in_progress: self.graph.count(NodeStatus::InProgress),
            completed: self.graph.count(NodeStatus::Completed),
            failed: self.graph.count(NodeStatus::Failed),
            active_agents: self.active_assignments(),
            reviews_in_flight: self.reviews.len(),
            critic_iterations: self
                .worktree
                .records()
                .iter()
                .map(|r| r.critic_iteration)
                .sum(),
            max_parallel_agents: self.config.execution.max_parallel_agents,
        }
    }
}
