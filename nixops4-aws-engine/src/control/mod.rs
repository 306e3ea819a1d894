//! Scheduling primitives for running resources concurrently in dependency order.

pub mod task_tracker;
pub mod thunk;
