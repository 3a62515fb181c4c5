//! Scheduler engine for DAG execution.
//!
//! This module keeps one cron trigger per enabled DAG in sync with the
//! definition store and fires runs when their schedules come due.

mod engine;
mod handle;
mod registry;
mod types;

pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use registry::TriggerRegistry;
pub use types::{OverlapPolicy, ReconcileReport, SchedulerError, SchedulerState, TriggerInfo};
