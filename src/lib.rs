//! Plan orchestration engine for the Ralph autonomous agent system.
//!
//! The engine turns a plan's task list into a dependency graph, dispatches
//! ready tasks to coding agents in isolated git worktrees, gates every
//! completion behind a critic review with a bounded fix-up budget, and
//! merges approved work back. A separate Ralph Loop mode re-runs a single
//! prompt against one persistent worktree until the agent's output carries
//! a completion promise.
//!
//! The crate is transport-agnostic. Callers supply an
//! [`agents::AgentRunner`] that actually executes agent runs, drive a plan
//! through [`scheduler::PlanScheduler`] or a loop through
//! [`ralph_loop::RalphLoopEngine`], and watch progress on the
//! [`events::EventBus`]. Scheduling, worktree lifecycle, review budgets,
//! and persistence all happen inside.

pub mod agents;
pub mod config;
pub mod critic;
pub mod error;
pub mod events;
pub mod git;
pub mod github;
pub mod graph;
pub mod models;
pub mod ralph_loop;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod worktree;

pub use config::EngineConfig;
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use models::{Plan, Task};
pub use ralph_loop::{RalphLoopEngine, RalphLoopHandle};
pub use scheduler::{PlanScheduler, PlanSchedulerHandle};
