//! Task and DAG execution.
//!
//! This module provides the outbound task invoker and the two execution
//! state machines layered on top of it.

mod dag_executor;
mod invoker;
mod task_runner;

pub use dag_executor::DagExecutor;
pub use invoker::{HttpInvoker, HttpInvokerOptions, InvocationError, TaskInvoker};
pub use task_runner::TaskRunner;

use thiserror::Error;

use crate::core::execution::{DagExecution, StateError};
use crate::storage::StorageError;

/// Errors that abort a DAG execution.
///
/// Task invocation failures are not errors at this level; they are recorded
/// on the task execution and drive the retry policy.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The terminal write of the run failed. The complete outcome is kept.
    #[error("failed to persist final state of dag execution {id}: {source}", id = .execution.id)]
    Persistence {
        execution: Box<DagExecution>,
        #[source]
        source: StorageError,
    },

    /// A state machine contract was breached. Signals a defect.
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] StateError),
}
