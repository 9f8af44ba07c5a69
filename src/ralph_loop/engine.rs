//! The reactive loop task.
//!
//! Mirrors the plan scheduler's single-owner design: one tokio task per
//! loop, every command and agent event serialized through one queue. There
//! is deliberately no pause/completion race: a pause request and an
//! iteration's terminal event are just two commands in line.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::agents::{AgentEvent, AgentHandle, AgentRunner, DispatchRequest};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::git::GitWorkspace;
use crate::models::{CommitSummary, GitSummary};
use crate::ralph_loop::types::{
    IterationStatus, RalphLoopConfig, RalphLoopState, RalphLoopStatus,
};
use crate::storage::{EventLog, LoopStore, Storage};
use crate::utils::generate_id;

/// Commands accepted by a running loop engine.
pub enum LoopCommand {
    /// Acquire the loop worktree and dispatch the first iteration
    Start,
    /// Finish the current iteration, then hold instead of starting the next
    Pause,
    /// Continue a paused loop with the next iteration
    Resume,
    /// Append a fresh iteration to a failed loop, same worktree
    Retry,
    /// Stop the running agent and end the loop as cancelled
    Cancel,
    /// Remove the worktree and stored state of a terminal loop
    Cleanup,
    /// Event from the agent running the given iteration
    AgentEvent { iteration: u32, event: AgentEvent },
    /// Snapshot of the full loop state
    GetState {
        reply: oneshot::Sender<RalphLoopState>,
    },
    /// Stop the engine task without touching loop state
    Shutdown,
}

/// Cloneable sender half for a spawned loop engine.
#[derive(Clone)]
pub struct RalphLoopHandle {
    loop_id: String,
    tx: mpsc::UnboundedSender<LoopCommand>,
}

impl RalphLoopHandle {
    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    /// Returns false once the engine task has exited.
    pub fn send(&self, command: LoopCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub async fn state(&self) -> Option<RalphLoopState> {
        let (reply, rx) = oneshot::channel();
        if !self.send(LoopCommand::GetState { reply }) {
            return None;
        }
        rx.await.ok()
    }
}

/// Single-owner reactive loop around one prompt, one agent, one worktree.
pub struct RalphLoopEngine {
    state: RalphLoopState,
    runner: Arc<dyn AgentRunner>,
    store: LoopStore,
    event_log: EventLog,
    bus: EventBus,
    rx: mpsc::UnboundedReceiver<LoopCommand>,
    self_tx: mpsc::UnboundedSender<LoopCommand>,
    repo_path: PathBuf,
    worktree_base: PathBuf,
    pending_events: Vec<EngineEvent>,
    /// Branch head before the current iteration, for the commit delta.
    iteration_base: Option<String>,
    /// A pause takes effect at the next iteration boundary, never mid-run.
    pause_pending: bool,
    fatal: bool,
    done: bool,
}

impl RalphLoopEngine {
    /// Prepares storage for the loop and spawns the engine task. The loop
    /// sits idle until it receives [`LoopCommand::Start`].
    pub fn spawn(
        config: RalphLoopConfig,
        runner: Arc<dyn AgentRunner>,
        bus: EventBus,
    ) -> Result<RalphLoopHandle, EngineError> {
        let repo_path = PathBuf::from(&config.project_path);
        let storage = Storage::init(&repo_path).map_err(EngineError::persistence)?;
        let worktree_base = storage.worktree_base();
        let state = RalphLoopState::new(config);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RalphLoopHandle {
            loop_id: state.id.clone(),
            tx: tx.clone(),
        };

        let engine = RalphLoopEngine {
            state,
            runner,
            store: storage.loops,
            event_log: storage.events,
            bus,
            rx,
            self_tx: tx,
            repo_path,
            worktree_base,
            pending_events: Vec::new(),
            iteration_base: None,
            pause_pending: false,
            fatal: false,
            done: false,
        };

        tokio::spawn(engine.run());
        Ok(handle)
    }

    async fn run(mut self) {
        log::info!(
            "[RalphLoop] Loop {} ready (budget {} iterations)",
            self.state.id,
            self.state.config.max_iterations
        );
        self.flush();

        while let Some(command) = self.rx.recv().await {
            if !self.apply(command) {
                break;
            }
        }

        log::info!("[RalphLoop] Loop {} engine stopped", self.state.id);
    }

    /// Applies one command. Returns false when the engine should exit.
    fn apply(&mut self, command: LoopCommand) -> bool {
        let state_changed = match command {
            LoopCommand::Shutdown => {
                log::info!("[RalphLoop] Loop {} shutting down", self.state.id);
                return false;
            }
            LoopCommand::GetState { reply } => {
                let _ = reply.send(self.state.clone());
                false
            }
            LoopCommand::Start => self.on_start(),
            LoopCommand::Pause => self.on_pause(),
            LoopCommand::Resume => self.on_resume(),
            LoopCommand::Retry => self.on_retry(),
            LoopCommand::Cancel => self.on_cancel(),
            LoopCommand::Cleanup => self.on_cleanup(),
            LoopCommand::AgentEvent { iteration, event } => {
                self.on_agent_event(iteration, event)
            }
        };

        if state_changed {
            self.flush();
        }
        !(self.fatal || self.done)
    }

    fn on_start(&mut self) -> bool {
        if self.state.status != RalphLoopStatus::Idle {
            log::warn!(
                "[RalphLoop] Ignoring start for loop {} in status {}",
                self.state.id,
                self.state.status
            );
            return false;
        }
        if let Err(e) = self.acquire_worktree() {
            log::error!(
                "[RalphLoop] Worktree setup failed for loop {}: {}",
                self.state.id,
                e
            );
            self.set_status(RalphLoopStatus::Failed);
            return true;
        }
        self.set_status(RalphLoopStatus::Running);
        self.start_iteration();
        true
    }

    /// One worktree per loop, created at start and reused by every
    /// iteration until cleanup.
    fn acquire_worktree(&mut self) -> Result<(), EngineError> {
        let workspace = GitWorkspace::open(&self.repo_path)?;
        // Seeds an empty repository with an initial commit so the default
        // branch exists before we branch off it.
        workspace.head_commit()?;
        let base = workspace.default_branch_name();

        let branch = format!("ralph/loop-{}", self.state.id);
        let path = self.worktree_base.join(format!("loop-{}", self.state.id));

        if path.exists() {
            log::warn!(
                "[RalphLoop] Removing stale worktree directory {}",
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

        workspace.create_branch(&branch, Some(&base), true)?;
        let path_str = path.to_string_lossy().to_string();
        workspace.create_worktree(&branch, &path_str, Some(&base))?;

        log::info!(
            "[RalphLoop] Created worktree for loop {} on branch {}",
            self.state.id,
            branch
        );
        self.state.worktree_path = Some(path_str);
        self.state.branch = Some(branch);
        Ok(())
    }

    fn start_iteration(&mut self) {
        let number = self.state.begin_iteration();
        self.pending_events.push(EngineEvent::loop_iteration_changed(
            &self.state.id,
            number,
            None,
            IterationStatus::Pending,
        ));

        self.iteration_base = self.state.branch.as_deref().and_then(|branch| {
            GitWorkspace::open(&self.repo_path)
                .and_then(|workspace| workspace.branch_head(branch))
                .ok()
        });

        let Some(working_dir) = self.state.worktree_path.clone() else {
            self.fail_iteration(number, "no worktree allocated");
            return;
        };
        let agent_id = generate_id();
        if let Some(iteration) = self.state.iteration_mut(number) {
            iteration.agent_id = Some(agent_id.clone());
        }

        // The same prompt goes out every iteration, verbatim. Progress
        // lives in the worktree, not in the conversation.
        let request = DispatchRequest {
            agent_id,
            agent_type: self.state.config.agent_type,
            model: self.state.config.model.clone(),
            prompt: self.state.config.prompt.clone(),
            working_dir,
        };

        log::info!(
            "[RalphLoop] Loop {} dispatching iteration {} of {}",
            self.state.id,
            number,
            self.state.config.max_iterations
        );
        match self.runner.dispatch(request) {
            Ok(handle) => self.spawn_forwarder(number, handle),
            Err(e) => self.fail_iteration(number, &format!("Dispatch failed: {}", e)),
        }
    }

    fn spawn_forwarder(&self, iteration: u32, mut handle: AgentHandle) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let mut terminal_seen = false;
            while let Some(event) = handle.events.recv().await {
                let is_terminal = event.is_terminal();
                if tx.send(LoopCommand::AgentEvent { iteration, event }).is_err() {
                    return;
                }
                if is_terminal {
                    terminal_seen = true;
                    break;
                }
            }
            if !terminal_seen {
                let _ = tx.send(LoopCommand::AgentEvent {
                    iteration,
                    event: AgentEvent::Failed {
                        error: "agent event stream ended without a terminal event".to_string(),
                    },
                });
            }
        });
    }

    fn on_agent_event(&mut self, number: u32, event: AgentEvent) -> bool {
        if number != self.state.current_iteration {
            log::debug!(
                "[RalphLoop] Stale event for loop {} iteration {}",
                self.state.id,
                number
            );
            return false;
        }
        let Some(status) = self.state.iteration(number).map(|i| i.status) else {
            return false;
        };
        if status.is_terminal() {
            log::debug!(
                "[RalphLoop] Ignoring event for finished iteration {} of loop {}",
                number,
                self.state.id
            );
            return false;
        }

        match event {
            AgentEvent::Started => {
                if status == IterationStatus::Pending {
                    self.set_iteration_status(number, IterationStatus::Running);
                    return true;
                }
                false
            }
            AgentEvent::OutputChunk { content } => {
                if let Some(iteration) = self.state.iteration_mut(number) {
                    iteration.output.push_str(&content);
                }
                self.bus.emit(EngineEvent::agent_output(
                    &self.state.id,
                    None,
                    Some(number),
                    &content,
                ));
                false
            }
            AgentEvent::Completed { message } => {
                if let Some(iteration) = self.state.iteration_mut(number) {
                    iteration.output.push_str(&message);
                }
                self.finish_iteration(number);
                true
            }
            AgentEvent::Failed { error } => {
                self.collect_commits(number);
                self.fail_iteration(number, &error);
                true
            }
        }
    }

    /// Iteration ended normally: bank its commits, scan the buffered output
    /// once for the completion promise, then complete, pause, exhaust, or
    /// go again.
    fn finish_iteration(&mut self, number: u32) {
        self.collect_commits(number);

        let detected = match self.state.iteration(number) {
            Some(iteration) => iteration
                .output
                .contains(self.state.config.completion_promise.as_str()),
            None => false,
        };
        if let Some(iteration) = self.state.iteration_mut(number) {
            iteration.promise_detected = detected;
        }
        self.set_iteration_status(number, IterationStatus::Completed);

        if detected {
            log::info!(
                "[RalphLoop] Loop {} found the completion promise in iteration {}",
                self.state.id,
                number
            );
            self.pause_pending = false;
            self.set_status(RalphLoopStatus::Completed);
        } else if number >= self.state.config.max_iterations {
            // Budget exhaustion wins over a pending pause: there is no
            // later iteration for a pause to hold back, so the loop ends
            // failed, never paused past its budget.
            log::warn!(
                "[RalphLoop] Loop {} spent its {}-iteration budget without the completion promise",
                self.state.id,
                self.state.config.max_iterations
            );
            self.pause_pending = false;
            self.set_status(RalphLoopStatus::Failed);
        } else if self.pause_pending {
            self.pause_pending = false;
            log::info!(
                "[RalphLoop] Loop {} paused after iteration {}",
                self.state.id,
                number
            );
            self.set_status(RalphLoopStatus::Paused);
        } else {
            self.start_iteration();
        }
    }

    fn fail_iteration(&mut self, number: u32, error: &str) {
        log::warn!(
            "[RalphLoop] Loop {} iteration {} failed: {}",
            self.state.id,
            number,
            error
        );
        if let Some(iteration) = self.state.iteration_mut(number) {
            iteration.error = Some(error.to_string());
        }
        self.set_iteration_status(number, IterationStatus::Failed);
        self.set_status(RalphLoopStatus::Failed);
    }

    /// Commits the current iteration added to the loop branch, folded into
    /// both the iteration record and the loop summary.
    fn collect_commits(&mut self, number: u32) {
        let Some(branch) = self.state.branch.clone() else {
            return;
        };
        let commits = match GitWorkspace::open(&self.repo_path)
            .and_then(|workspace| workspace.commits_in_range(self.iteration_base.as_deref(), &branch))
        {
            Ok(commits) => commits,
            Err(e) => {
                log::warn!(
                    "[RalphLoop] Commit collection failed for loop {}: {}",
                    self.state.id,
                    e
                );
                return;
            }
        };
        if commits.is_empty() {
            return;
        }

        let summaries: Vec<CommitSummary> =
            commits.into_iter().map(CommitSummary::from).collect();
        log::info!(
            "[RalphLoop] Loop {} iteration {} added {} commit(s)",
            self.state.id,
            number,
            summaries.len()
        );
        if let Some(iteration) = self.state.iteration_mut(number) {
            iteration.commits = summaries.clone();
        }
        self.state.git_summary.merge(GitSummary {
            commits: summaries,
            pull_requests: Vec::new(),
        });
    }

    fn on_pause(&mut self) -> bool {
        if self.state.status != RalphLoopStatus::Running {
            log::warn!(
                "[RalphLoop] Ignoring pause for loop {} in status {}",
                self.state.id,
                self.state.status
            );
            return false;
        }
        if !self.pause_pending {
            self.pause_pending = true;
            log::info!(
                "[RalphLoop] Loop {} will pause after the current iteration",
                self.state.id
            );
        }
        false
    }

    fn on_resume(&mut self) -> bool {
        if self.pause_pending {
            // The pause never landed; withdrawing it is all a resume means
            self.pause_pending = false;
            log::info!("[RalphLoop] Loop {} pending pause withdrawn", self.state.id);
            return false;
        }
        if self.state.status != RalphLoopStatus::Paused {
            log::warn!(
                "[RalphLoop] Ignoring resume for loop {} in status {}",
                self.state.id,
                self.state.status
            );
            return false;
        }
        log::info!("[RalphLoop] Resuming loop {}", self.state.id);
        self.set_status(RalphLoopStatus::Running);
        self.start_iteration();
        true
    }

    /// A failed loop gets another iteration in the same worktree. The
    /// iteration budget is not reset.
    fn on_retry(&mut self) -> bool {
        if self.state.status != RalphLoopStatus::Failed {
            log::warn!(
                "[RalphLoop] Ignoring retry for loop {} in status {}",
                self.state.id,
                self.state.status
            );
            return false;
        }
        if self.state.worktree_path.is_none() {
            log::warn!(
                "[RalphLoop] Cannot retry loop {} after cleanup",
                self.state.id
            );
            return false;
        }
        log::info!("[RalphLoop] Retrying loop {}", self.state.id);
        self.set_status(RalphLoopStatus::Running);
        self.start_iteration();
        true
    }

    fn on_cancel(&mut self) -> bool {
        if self.state.status.is_terminal() {
            log::warn!(
                "[RalphLoop] Ignoring cancel for loop {} in status {}",
                self.state.id,
                self.state.status
            );
            return false;
        }
        log::info!("[RalphLoop] Cancelling loop {}", self.state.id);

        let number = self.state.current_iteration;
        let running = self
            .state
            .iteration(number)
            .map(|i| (!i.status.is_terminal(), i.agent_id.clone()));
        if let Some((true, agent_id)) = running {
            if let Some(agent_id) = agent_id {
                self.runner.stop(&agent_id);
            }
            self.collect_commits(number);
            if let Some(iteration) = self.state.iteration_mut(number) {
                iteration.error = Some("loop cancelled".to_string());
            }
            self.set_iteration_status(number, IterationStatus::Failed);
        }

        self.pause_pending = false;
        self.set_status(RalphLoopStatus::Cancelled);
        true
    }

    /// Deletes the worktree, the loop branch, and the stored record, then
    /// stops the engine. Only meaningful once the loop is terminal.
    fn on_cleanup(&mut self) -> bool {
        if !self.state.status.is_terminal() {
            log::warn!(
                "[RalphLoop] Ignoring cleanup for non-terminal loop {}",
                self.state.id
            );
            return false;
        }
        log::info!("[RalphLoop] Cleaning up loop {}", self.state.id);

        if let Some(path) = self.state.worktree_path.take() {
            match GitWorkspace::open(&self.repo_path) {
                Ok(workspace) => {
                    if let Err(e) = workspace.remove_worktree(&path) {
                        log::warn!("[RalphLoop] Worktree removal failed: {}", e);
                        let _ = std::fs::remove_dir_all(&path);
                        let _ = workspace.prune_orphaned_worktrees();
                    }
                }
                Err(e) => log::warn!("[RalphLoop] {}", e),
            }
        }
        if let Some(branch) = self.state.branch.take() {
            if let Ok(workspace) = GitWorkspace::open(&self.repo_path) {
                if let Err(e) = workspace.delete_branch(&branch) {
                    log::warn!("[RalphLoop] Branch delete failed: {}", e);
                }
            }
        }
        if let Err(e) = self.store.delete(&self.state.id) {
            log::warn!("[RalphLoop] Loop record delete failed: {}", e);
        }
        if let Err(e) = self.event_log.delete(&self.state.id) {
            log::warn!("[RalphLoop] Event log delete failed: {}", e);
        }

        self.done = true;
        false
    }

    fn set_status(&mut self, target: RalphLoopStatus) -> bool {
        if self.state.status == target {
            return false;
        }
        let old = self.state.status;
        self.state.status = target;
        self.state.updated_at = Utc::now();
        log::info!("[RalphLoop] Loop {}: {} -> {}", self.state.id, old, target);
        self.pending_events.push(EngineEvent::loop_status_changed(
            &self.state.id,
            old,
            target,
        ));
        true
    }

    fn set_iteration_status(&mut self, number: u32, target: IterationStatus) {
        let loop_id = self.state.id.clone();
        if let Some(iteration) = self.state.iteration_mut(number) {
            if iteration.status == target {
                return;
            }
            let old = iteration.status;
            iteration.status = target;
            if target.is_terminal() {
                iteration.completed_at = Some(Utc::now());
            }
            self.pending_events.push(EngineEvent::loop_iteration_changed(
                &loop_id,
                number,
                Some(old),
                target,
            ));
        }
    }

    /// Durability barrier: loop state is written before any queued event is
    /// published. A persistence failure is fatal to the loop.
    fn flush(&mut self) {
        if let Err(e) = self.persist() {
            log::error!(
                "[RalphLoop] Loop {} persistence failed: {}",
                self.state.id,
                e
            );
            let old = self.state.status;
            self.state.status = RalphLoopStatus::Failed;
            self.fatal = true;
            self.pending_events.clear();
            self.bus.emit(EngineEvent::loop_status_changed(
                &self.state.id,
                old,
                RalphLoopStatus::Failed,
            ));
            return;
        }
        for event in std::mem::take(&mut self.pending_events) {
            if event.is_transition() {
                if let Err(e) = self.event_log.append(&self.state.id, &event) {
                    log::warn!("[RalphLoop] Event log append failed: {}", e);
                }
            }
            self.bus.emit(event);
        }
    }

    fn persist(&self) -> Result<(), EngineError> {
        self.store.save(&self.state).map_err(EngineError::persistence)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::agents::testing::ScriptedRunner;

    use super::*;

    const PROMISE: &str = "<promise>COMPLETE</promise>";

    fn setup_repo() -> TempDir {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.md"), "# Fixture\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        dir
    }

    fn loop_config(dir: &TempDir) -> RalphLoopConfig {
        RalphLoopConfig::new(
            "ws-1",
            dir.path().to_string_lossy(),
            "Keep improving the code",
        )
    }

    fn spawn_loop(
        config: RalphLoopConfig,
        runner: &ScriptedRunner,
    ) -> RalphLoopHandle {
        RalphLoopEngine::spawn(config, Arc::new(runner.clone()), EventBus::new()).unwrap()
    }

    async fn wait_loop<F>(
        handle: &RalphLoopHandle,
        description: &str,
        predicate: F,
    ) -> RalphLoopState
    where
        F: Fn(&RalphLoopState) -> bool,
    {
        for _ in 0..500 {
            if let Some(state) = handle.state().await {
                if predicate(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {}", description);
    }

    #[tokio::test]
    async fn test_loop_stops_at_the_iteration_with_the_promise() {
        let dir = setup_repo();
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();
        let runner = ScriptedRunner::new().with_auto(move |_request| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let message = if n == 3 {
                format!("All done.\n{}", PROMISE)
            } else {
                "More to do".to_string()
            };
            vec![AgentEvent::Completed { message }]
        });
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        let state = wait_loop(&handle, "loop completed", |s| {
            s.status == RalphLoopStatus::Completed
        })
        .await;

        assert_eq!(state.iterations.len(), 3);
        assert!(!state.iteration(1).unwrap().promise_detected);
        assert!(!state.iteration(2).unwrap().promise_detected);
        assert!(state.iteration(3).unwrap().promise_detected);
        assert!(state.promise_detected());
        assert_eq!(runner.dispatch_count(), 3);

        // Same prompt, same worktree, every time
        let dispatches = runner.dispatches();
        for dispatch in &dispatches {
            assert_eq!(dispatch.prompt, "Keep improving the code");
            assert_eq!(dispatch.working_dir, dispatches[0].working_dir);
        }
        assert_eq!(
            state.branch.as_deref(),
            Some(format!("ralph/loop-{}", state.id).as_str())
        );
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_the_loop() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new().with_auto(|_request| {
            vec![AgentEvent::Completed {
                message: "Still going".to_string(),
            }]
        });
        let mut config = loop_config(&dir);
        config.max_iterations = 3;
        let handle = spawn_loop(config, &runner);

        handle.send(LoopCommand::Start);
        let state = wait_loop(&handle, "loop failed", |s| {
            s.status == RalphLoopStatus::Failed
        })
        .await;

        // Exactly the budget, not one more
        assert_eq!(state.iterations.len(), 3);
        assert_eq!(runner.dispatch_count(), 3);
        assert!(!state.promise_detected());
        assert_eq!(state.completed_iterations(), 3);
    }

    #[tokio::test]
    async fn test_pause_on_the_final_budgeted_iteration_still_fails_the_loop() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new();
        let mut config = loop_config(&dir);
        config.max_iterations = 1;
        let handle = spawn_loop(config, &runner);

        handle.send(LoopCommand::Start);
        wait_loop(&handle, "first iteration running", |s| {
            s.iteration(1).map(|i| i.status) == Some(IterationStatus::Running)
        })
        .await;

        // Pause mid-flight, then let the only budgeted iteration finish
        // without the promise
        handle.send(LoopCommand::Pause);
        let agent = runner.agent_id_at(0).unwrap();
        assert!(runner.send(
            &agent,
            AgentEvent::Completed {
                message: "no promise".to_string()
            }
        ));

        let state = wait_loop(&handle, "loop failed", |s| {
            s.status == RalphLoopStatus::Failed
        })
        .await;
        assert_eq!(state.iterations.len(), 1);
        assert_eq!(runner.dispatch_count(), 1);

        // Resume cannot reopen a spent budget; retry is the only way on
        handle.send(LoopCommand::Resume);
        let state = wait_loop(&handle, "resume ignored", |s| {
            s.status == RalphLoopStatus::Failed
        })
        .await;
        assert_eq!(state.iterations.len(), 1);
        assert_eq!(runner.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_lands_between_iterations_and_resume_continues() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new();
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        wait_loop(&handle, "first iteration running", |s| {
            s.iteration(1).map(|i| i.status) == Some(IterationStatus::Running)
        })
        .await;

        // Pause while the iteration is mid-flight, then let it finish
        handle.send(LoopCommand::Pause);
        let agent = runner.agent_id_at(0).unwrap();
        assert!(runner.send(
            &agent,
            AgentEvent::Completed {
                message: "no promise yet".to_string()
            }
        ));

        let state = wait_loop(&handle, "loop paused", |s| {
            s.status == RalphLoopStatus::Paused
        })
        .await;
        assert_eq!(state.iterations.len(), 1);
        assert_eq!(runner.dispatch_count(), 1);

        handle.send(LoopCommand::Resume);
        wait_loop(&handle, "second iteration dispatched", |s| {
            s.current_iteration == 2 && s.status == RalphLoopStatus::Running
        })
        .await;
        assert_eq!(runner.dispatch_count(), 2);

        let agent = runner.agent_id_at(1).unwrap();
        assert!(runner.send(
            &agent,
            AgentEvent::Completed {
                message: format!("done {}", PROMISE)
            }
        ));
        wait_loop(&handle, "loop completed", |s| {
            s.status == RalphLoopStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn test_iteration_failure_fails_loop_and_retry_appends() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new();
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        wait_loop(&handle, "first iteration running", |s| {
            s.iteration(1).map(|i| i.status) == Some(IterationStatus::Running)
        })
        .await;

        let agent = runner.agent_id_at(0).unwrap();
        assert!(runner.send(
            &agent,
            AgentEvent::Failed {
                error: "agent crashed".to_string()
            }
        ));
        let state = wait_loop(&handle, "loop failed", |s| {
            s.status == RalphLoopStatus::Failed
        })
        .await;
        let failed = state.iteration(1).unwrap();
        assert_eq!(failed.status, IterationStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("agent crashed"));

        // No auto-retry: explicit command appends iteration 2 in the same
        // worktree
        handle.send(LoopCommand::Retry);
        wait_loop(&handle, "retry dispatched", |s| s.current_iteration == 2).await;
        let dispatches = runner.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[1].working_dir, dispatches[0].working_dir);

        let agent = runner.agent_id_at(1).unwrap();
        assert!(runner.send(
            &agent,
            AgentEvent::Completed {
                message: PROMISE.to_string()
            }
        ));
        let state = wait_loop(&handle, "loop completed", |s| {
            s.status == RalphLoopStatus::Completed
        })
        .await;
        assert_eq!(state.iterations.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_agent_and_cleanup_removes_everything() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new();
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        wait_loop(&handle, "first iteration running", |s| {
            s.iteration(1).map(|i| i.status) == Some(IterationStatus::Running)
        })
        .await;

        handle.send(LoopCommand::Cancel);
        let state = wait_loop(&handle, "loop cancelled", |s| {
            s.status == RalphLoopStatus::Cancelled
        })
        .await;
        assert!(runner.stopped().contains(&runner.agent_id_at(0).unwrap()));
        let iteration = state.iteration(1).unwrap();
        assert_eq!(iteration.status, IterationStatus::Failed);
        assert!(iteration.error.as_deref().unwrap().contains("cancelled"));

        let worktree_path = state.worktree_path.clone().unwrap();
        assert!(Path::new(&worktree_path).exists());

        handle.send(LoopCommand::Cleanup);
        for _ in 0..500 {
            if handle.state().await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.state().await.is_none());
        assert!(!Path::new(&worktree_path).exists());

        let storage = Storage::init(dir.path()).unwrap();
        assert!(storage.loops.load(&state.id).is_err());
    }

    #[tokio::test]
    async fn test_commits_are_banked_per_iteration() {
        let dir = setup_repo();
        let counter = Arc::new(AtomicU32::new(0));
        let calls = counter.clone();
        let runner = ScriptedRunner::new().with_auto(move |request| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let workdir = Path::new(&request.working_dir);
            std::fs::write(
                workdir.join(format!("step_{}.txt", n)),
                format!("iteration {}\n", n),
            )
            .unwrap();
            let workspace = GitWorkspace::open(workdir).unwrap();
            workspace.stage_all().unwrap();
            workspace
                .create_commit(
                    &format!("Iteration {} work", n),
                    "Test User",
                    "test@example.com",
                )
                .unwrap();

            let message = if n == 2 {
                format!("finished {}", PROMISE)
            } else {
                "keep going".to_string()
            };
            vec![AgentEvent::Completed { message }]
        });
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        let state = wait_loop(&handle, "loop completed", |s| {
            s.status == RalphLoopStatus::Completed
        })
        .await;

        assert_eq!(state.iteration(1).unwrap().commits.len(), 1);
        assert_eq!(state.iteration(2).unwrap().commits.len(), 1);
        assert_eq!(state.git_summary.commits.len(), 2);
        let messages: Vec<&str> = state
            .git_summary
            .commits
            .iter()
            .map(|c| c.message.as_str())
            .collect();
        assert!(messages.iter().any(|m| m.contains("Iteration 1 work")));
        assert!(messages.iter().any(|m| m.contains("Iteration 2 work")));
    }

    #[tokio::test]
    async fn test_start_is_only_honored_once() {
        let dir = setup_repo();
        let runner = ScriptedRunner::new();
        let handle = spawn_loop(loop_config(&dir), &runner);

        handle.send(LoopCommand::Start);
        handle.send(LoopCommand::Start);
        let state = wait_loop(&handle, "first iteration running", |s| {
            s.current_iteration == 1
        })
        .await;
        assert_eq!(state.iterations.len(), 1);
        assert_eq!(runner.dispatch_count(), 1);
    }
}
