//! Reactive plan scheduler.
//!
//! One scheduler task runs per executing plan. Every external input for a
//! plan (user commands, worker events, critic events) is serialized through
//! a single command queue, so graph recomputation never races agent arrival
//! order.

mod plan_scheduler;

pub use plan_scheduler::{
    build_task_prompt, PlanCommand, PlanScheduler, PlanSchedulerHandle, SchedulerStats,
};
