//! DAG execution state machine.
//!
//! The `DagExecutor` runs a DAG's tasks strictly in declaration order and
//! stops at the first task whose terminal outcome is failure. The execution
//! record is persisted when the run starts, after every task, and once more
//! when it reaches its terminal status.

use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};

use super::ExecutionError;
use super::invoker::TaskInvoker;
use super::task_runner::TaskRunner;
use crate::core::definition::DagDefinition;
use crate::core::execution::{DagExecution, ExecutionStatus};
use crate::events::{Event, EventBus};
use crate::storage::ExecutionStore;

/// Executor for running DAGs task by task.
#[derive(Clone)]
pub struct DagExecutor {
    runner: TaskRunner,
}

impl DagExecutor {
    /// Create an executor around a task runner.
    pub fn new(runner: TaskRunner) -> Self {
        Self { runner }
    }

    /// Create an executor with an immediate-retry runner.
    pub fn from_parts(invoker: Arc<dyn TaskInvoker>, store: Arc<dyn ExecutionStore>) -> Self {
        Self::new(TaskRunner::new(invoker, store))
    }

    /// Builder: wait this long between task attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.runner = self.runner.with_retry_delay(delay);
        self
    }

    /// Builder: emit lifecycle events to this bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.runner = self.runner.with_event_bus(bus);
        self
    }

    /// The event bus, if any.
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.runner.event_bus()
    }

    /// Create the running record for one fire of `dag` without any I/O.
    pub fn prepare(&self, dag: &DagDefinition) -> DagExecution {
        DagExecution::new(dag)
    }

    /// Prepare and execute one run of `dag`.
    pub async fn run_dag(&self, dag: &DagDefinition) -> Result<DagExecution, ExecutionError> {
        let execution = self.prepare(dag);
        self.execute(dag, execution).await
    }

    /// Drive a prepared run to its terminal status.
    ///
    /// Returns the final record, already persisted. If only the terminal
    /// write fails, the complete record is carried in
    /// [`ExecutionError::Persistence`].
    pub async fn execute(
        &self,
        dag: &DagDefinition,
        execution: DagExecution,
    ) -> Result<DagExecution, ExecutionError> {
        let span = info_span!(
            "dag_execution",
            dag = %dag.id,
            execution = %execution.id,
            task_count = dag.tasks.len(),
        );
        self.execute_inner(dag, execution).instrument(span).await
    }

    async fn execute_inner(
        &self,
        dag: &DagDefinition,
        mut execution: DagExecution,
    ) -> Result<DagExecution, ExecutionError> {
        debug!("starting DAG execution");
        self.persist(&execution).await;
        self.runner
            .emit(Event::dag_started(dag.id.clone(), execution.id.clone()))
            .await;

        for task in &dag.tasks {
            let task_execution = self
                .runner
                .run_task(&dag.id, &execution.id, task, None)
                .await?;
            let failed = task_execution.status == ExecutionStatus::Failed;
            let task_execution_id = task_execution.id.clone();

            execution.record_task(task_execution)?;
            self.persist(&execution).await;

            if failed {
                debug!(task = %task.id, "task failed, stopping DAG");
                execution.mark_failed(&task_execution_id)?;
                return self.finish(execution).await;
            }
        }

        execution.mark_success()?;
        self.finish(execution).await
    }

    async fn persist(&self, execution: &DagExecution) {
        if let Err(e) = self.runner.store().upsert_dag_execution(execution).await {
            warn!(
                execution = %execution.id,
                status = %execution.status,
                error = %e,
                "Failed to persist dag execution"
            );
        }
    }

    async fn finish(&self, execution: DagExecution) -> Result<DagExecution, ExecutionError> {
        let duration = execution
            .end
            .map(|end| Duration::from_millis((end - execution.start).max(0) as u64))
            .unwrap_or_default();
        debug!(status = %execution.status, ?duration, "DAG execution finished");

        let written = self.runner.store().upsert_dag_execution(&execution).await;
        self.runner
            .emit(Event::dag_completed(
                execution.dag_id.clone(),
                execution.id.clone(),
                execution.status,
                duration,
            ))
            .await;

        match written {
            Ok(()) => Ok(execution),
            Err(source) => Err(ExecutionError::Persistence {
                execution: Box::new(execution),
                source,
            }),
        }
    }
}
