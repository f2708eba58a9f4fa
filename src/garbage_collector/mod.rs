//! Retention sweeps over terminal strands.

mod task;

pub use task::{GarbageCollectorConfig, RetentionSweeper, spawn_garbage_collector};
