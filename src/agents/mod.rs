// Agent dispatch interface
//
// The engine never spawns or supervises agent processes itself. It hands a
// prompt and a working directory to an `AgentRunner` and consumes the event
// stream the runner gives back. Process, PTY, and transport concerns live
// entirely on the runner side of this trait.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;

/// Which agent CLI executes the work. The runner maps this to an actual
/// command; the engine only carries it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Opencode,
    Cursor,
    Codex,
}

impl Default for AgentType {
    fn default() -> Self {
        AgentType::Claude
    }
}

/// Everything a runner needs to start one agent run.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Engine-generated id the runner must tag the run with.
    pub agent_id: String,
    pub agent_type: AgentType,
    pub model: Option<String>,
    pub prompt: String,
    /// Directory the agent works in, usually a task or loop worktree.
    pub working_dir: String,
}

/// Events a runner reports for one agent run, in order. Exactly one
/// terminal event (`Completed` or `Failed`) ends the stream; a runner that
/// drops the sender without one is treated as failed.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The agent process is up and working.
    Started,
    /// A chunk of agent output.
    OutputChunk { content: String },
    /// The agent finished normally. `message` is its final output.
    Completed { message: String },
    /// The agent crashed or exited abnormally.
    Failed { error: String },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Completed { .. } | AgentEvent::Failed { .. })
    }
}

/// Live handle to one dispatched agent.
pub struct AgentHandle {
    pub agent_id: String,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

/// External collaborator that executes agent runs.
///
/// `dispatch` must not block on the agent itself: it starts the run and
/// returns a handle immediately. `stop` requests a cooperative shutdown;
/// a well-behaved runner answers with a terminal event on the handle's
/// stream, but the engine does not depend on it (cancellation applies a
/// grace deadline of its own).
pub trait AgentRunner: Send + Sync {
    fn dispatch(&self, request: DispatchRequest) -> Result<AgentHandle, EngineError>;

    fn stop(&self, agent_id: &str);
}

#[cfg(test)]
pub mod testing {
    //! Scripted in-memory runner for scheduler and loop tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type AutoScript = dyn Fn(&DispatchRequest) -> Vec<AgentEvent> + Send + Sync;

    #[derive(Default)]
    struct RunnerInner {
        senders: HashMap<String, mpsc::UnboundedSender<AgentEvent>>,
        dispatches: Vec<DispatchRequest>,
        stopped: Vec<String>,
    }

    /// Test runner. Every dispatch emits `Started` plus whatever the
    /// optional auto script returns for the request, unless starts are
    /// held; tests drive the rest with `send`. `stop` is recorded, and
    /// optionally acknowledged with a terminal `Failed` event the way a
    /// cooperative agent would.
    #[derive(Clone)]
    pub struct ScriptedRunner {
        inner: Arc<Mutex<RunnerInner>>,
        auto: Option<Arc<AutoScript>>,
        acknowledge_stops: bool,
        hold_starts: bool,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(RunnerInner::default())),
                auto: None,
                acknowledge_stops: false,
                hold_starts: false,
            }
        }

        /// Emit these events right after `Started` on every dispatch.
        pub fn with_auto(
            mut self,
            script: impl Fn(&DispatchRequest) -> Vec<AgentEvent> + Send + Sync + 'static,
        ) -> Self {
            self.auto = Some(Arc::new(script));
            self
        }

        /// Answer every `stop` with a terminal event.
        pub fn with_acknowledge_stops(mut self) -> Self {
            self.acknowledge_stops = true;
            self
        }

        /// Emit nothing on dispatch. Agents stay silent, so their
        /// assignments hold at `sent` until the test sends `Started`.
        pub fn with_held_starts(mut self) -> Self {
            self.hold_starts = true;
            self
        }

        pub fn dispatches(&self) -> Vec<DispatchRequest> {
            self.inner.lock().unwrap().dispatches.clone()
        }

        pub fn dispatch_count(&self) -> usize {
            self.inner.lock().unwrap().dispatches.len()
        }

        pub fn stopped(&self) -> Vec<String> {
            self.inner.lock().unwrap().stopped.clone()
        }

        /// Inject an event into a live agent's stream. Returns false if the
        /// agent is unknown or its receiver is gone.
        pub fn send(&self, agent_id: &str, event: AgentEvent) -> bool {
            let inner = self.inner.lock().unwrap();
            inner
                .senders
                .get(agent_id)
                .map(|tx| tx.send(event).is_ok())
                .unwrap_or(false)
        }

        /// Agent id of the nth dispatch, in dispatch order.
        pub fn agent_id_at(&self, index: usize) -> Option<String> {
            self.inner
                .lock()
                .unwrap()
                .dispatches
                .get(index)
                .map(|d| d.agent_id.clone())
        }
    }

    impl Default for ScriptedRunner {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AgentRunner for ScriptedRunner {
        fn dispatch(&self, request: DispatchRequest) -> Result<AgentHandle, EngineError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let agent_id = request.agent_id.clone();

            if !self.hold_starts {
                let _ = tx.send(AgentEvent::Started);
                if let Some(auto) = &self.auto {
                    for event in auto(&request) {
                        let _ = tx.send(event);
                    }
                }
            }

            let mut inner = self.inner.lock().unwrap();
            inner.senders.insert(agent_id.clone(), tx);
            inner.dispatches.push(request);

            Ok(AgentHandle {
                agent_id,
                events: rx,
            })
        }

        fn stop(&self, agent_id: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped.push(agent_id.to_string());
            if self.acknowledge_stops {
                if let Some(tx) = inner.senders.get(agent_id) {
                    let _ = tx.send(AgentEvent::Failed {
                        error: "agent stopped".to_string(),
                    });
                }
            }
        }
    }
}
