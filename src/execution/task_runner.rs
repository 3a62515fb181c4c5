//! Task execution state machine.
//!
//! Drives one task through its attempts to a terminal outcome, mirroring
//! every transition to the execution store:
//!
//! 1. start an attempt on the task's record (created on first use)
//! 2. persist it as `running` before the call
//! 3. invoke the endpoint exactly once
//! 4. persist the outcome, and loop while the retry policy allows

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::ExecutionError;
use super::invoker::TaskInvoker;
use crate::core::definition::TaskDefinition;
use crate::core::execution::TaskExecution;
use crate::core::retry::RetryPolicy;
use crate::core::types::{DagExecutionId, DagId};
use crate::events::{Event, EventBus};
use crate::storage::ExecutionStore;

/// Runs single tasks with retries.
#[derive(Clone)]
pub struct TaskRunner {
    invoker: Arc<dyn TaskInvoker>,
    store: Arc<dyn ExecutionStore>,
    retry_delay: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl TaskRunner {
    /// Create a runner retrying immediately.
    pub fn new(invoker: Arc<dyn TaskInvoker>, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            invoker,
            store,
            retry_delay: Duration::ZERO,
            event_bus: None,
        }
    }

    /// Builder: wait this long between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Builder: emit lifecycle events to this bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// The store this runner persists to.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// The event bus, if any.
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    pub(crate) async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }

    async fn persist(&self, execution: &TaskExecution) {
        if let Err(e) = self.store.upsert_task_execution(execution).await {
            warn!(
                task_execution = %execution.id,
                status = %execution.status,
                error = %e,
                "Failed to persist task execution"
            );
        }
    }

    /// Run `task` to a terminal outcome within DAG execution `dag_execution_id`.
    ///
    /// When `existing` is given its record is reused, so attempts keep
    /// counting on the same identifier. Invocation failures never escape as
    /// errors; they end up in the returned record.
    pub async fn run_task(
        &self,
        dag_id: &DagId,
        dag_execution_id: &DagExecutionId,
        task: &TaskDefinition,
        existing: Option<TaskExecution>,
    ) -> Result<TaskExecution, ExecutionError> {
        let policy = RetryPolicy::for_task(task).with_delay(self.retry_delay);
        let mut record =
            existing.unwrap_or_else(|| TaskExecution::new(dag_execution_id.clone(), task));

        loop {
            record.begin_attempt(policy.max_attempts)?;
            self.persist(&record).await;
            self.emit(Event::task_started(
                task.id.clone(),
                dag_id.clone(),
                dag_execution_id.clone(),
                record.attempts,
            ))
            .await;

            debug!(
                task = %task.id,
                attempt = record.attempts,
                max_attempts = policy.max_attempts,
                "invoking task"
            );

            match self.invoker.invoke(task).await {
                Ok(()) => {
                    record.mark_success();
                    debug!(
                        task = %task.id,
                        attempts = record.attempts,
                        duration_ms = record.duration_ms(),
                        "task succeeded"
                    );
                    self.persist(&record).await;
                    self.emit(Event::task_succeeded(
                        task.id.clone(),
                        dag_id.clone(),
                        dag_execution_id.clone(),
                        record.attempts,
                    ))
                    .await;
                    return Ok(record);
                }
                Err(err) => {
                    let detail = err.detail();
                    record.mark_failed(detail.clone());
                    self.persist(&record).await;

                    if !policy.should_retry(record.attempts) {
                        debug!(
                            task = %task.id,
                            attempts = record.attempts,
                            duration_ms = record.duration_ms(),
                            error = %detail,
                            "task failed"
                        );
                        self.emit(Event::task_failed(
                            task.id.clone(),
                            dag_id.clone(),
                            dag_execution_id.clone(),
                            record.attempts,
                            detail,
                        ))
                        .await;
                        return Ok(record);
                    }

                    self.emit(Event::task_retrying(
                        task.id.clone(),
                        dag_id.clone(),
                        dag_execution_id.clone(),
                        record.attempts,
                        policy.max_attempts,
                        detail,
                    ))
                    .await;
                    if !policy.delay.is_zero() {
                        sleep(policy.delay).await;
                    }
                }
            }
        }
    }
}
