//! Lifecycle events and event handling.
//!
//! Events mirror the state transitions of DAG and task executions plus the
//! reconciler's trigger changes. They are informational; the persisted
//! execution records remain the source of truth.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::execution::ExecutionStatus;
use crate::core::types::{DagExecutionId, DagId, TaskId};

/// Lifecycle events emitted by the executors and the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A DAG run has been persisted and is about to run its first task.
    DagStarted {
        dag_id: DagId,
        execution_id: DagExecutionId,
        timestamp: Instant,
    },

    /// A DAG run reached a terminal status.
    DagCompleted {
        dag_id: DagId,
        execution_id: DagExecutionId,
        status: ExecutionStatus,
        duration: Duration,
        timestamp: Instant,
    },

    /// A task attempt has started.
    TaskStarted {
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempt: u32,
        timestamp: Instant,
    },

    /// A task attempt succeeded. Final for the task.
    TaskSucceeded {
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempts: u32,
        timestamp: Instant,
    },

    /// A task failed and will not be retried.
    TaskFailed {
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempts: u32,
        error: String,
        timestamp: Instant,
    },

    /// A task attempt failed and another attempt follows.
    TaskRetrying {
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        /// The attempt number that just failed (1-indexed).
        attempt: u32,
        /// Total attempts allowed, including the first.
        max_attempts: u32,
        error: String,
        timestamp: Instant,
    },

    /// The trigger registry was synchronized with the definition store.
    TriggersReconciled {
        added: usize,
        updated: usize,
        removed: usize,
        rejected: usize,
        timestamp: Instant,
    },

    /// A due trigger did not fire because a run of the same DAG was in flight.
    TriggerSkipped { dag_id: DagId, timestamp: Instant },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::DagStarted { timestamp, .. } => *timestamp,
            Event::DagCompleted { timestamp, .. } => *timestamp,
            Event::TaskStarted { timestamp, .. } => *timestamp,
            Event::TaskSucceeded { timestamp, .. } => *timestamp,
            Event::TaskFailed { timestamp, .. } => *timestamp,
            Event::TaskRetrying { timestamp, .. } => *timestamp,
            Event::TriggersReconciled { timestamp, .. } => *timestamp,
            Event::TriggerSkipped { timestamp, .. } => *timestamp,
        }
    }

    /// Create a DagStarted event.
    pub fn dag_started(dag_id: DagId, execution_id: DagExecutionId) -> Self {
        Event::DagStarted {
            dag_id,
            execution_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a DagCompleted event.
    pub fn dag_completed(
        dag_id: DagId,
        execution_id: DagExecutionId,
        status: ExecutionStatus,
        duration: Duration,
    ) -> Self {
        Event::DagCompleted {
            dag_id,
            execution_id,
            status,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskStarted event.
    pub fn task_started(
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempt: u32,
    ) -> Self {
        Event::TaskStarted {
            task_id,
            dag_id,
            execution_id,
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskSucceeded event.
    pub fn task_succeeded(
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempts: u32,
    ) -> Self {
        Event::TaskSucceeded {
            task_id,
            dag_id,
            execution_id,
            attempts,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskFailed event.
    pub fn task_failed(
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempts: u32,
        error: String,
    ) -> Self {
        Event::TaskFailed {
            task_id,
            dag_id,
            execution_id,
            attempts,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskRetrying event.
    pub fn task_retrying(
        task_id: TaskId,
        dag_id: DagId,
        execution_id: DagExecutionId,
        attempt: u32,
        max_attempts: u32,
        error: String,
    ) -> Self {
        Event::TaskRetrying {
            task_id,
            dag_id,
            execution_id,
            attempt,
            max_attempts,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggersReconciled event.
    pub fn triggers_reconciled(
        added: usize,
        updated: usize,
        removed: usize,
        rejected: usize,
    ) -> Self {
        Event::TriggersReconciled {
            added,
            updated,
            removed,
            rejected,
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggerSkipped event.
    pub fn trigger_skipped(dag_id: DagId) -> Self {
        Event::TriggerSkipped {
            dag_id,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
