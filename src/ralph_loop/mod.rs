//! Iterative loop engine
//!
//! Runs one prompt against an agent over and over in a single persistent
//! worktree until the output contains the completion promise or the
//! iteration budget is spent. Split into:
//! - `types` - Persisted loop state, iterations, configuration
//! - `engine` - The reactive loop task and its command queue

pub mod engine;
pub mod types;

pub use engine::{LoopCommand, RalphLoopEngine, RalphLoopHandle};
pub use types::{
    IterationStatus, RalphLoopConfig, RalphLoopIteration, RalphLoopState, RalphLoopStatus,
};
