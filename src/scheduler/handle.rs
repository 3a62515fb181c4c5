//! Scheduler handle for controlling the scheduler.
//!
//! This module provides the `SchedulerHandle` type that allows external control
//! of the scheduler through commands like trigger, refresh, and shutdown.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::types::{DagExecutionId, DagId};

use super::types::{ReconcileReport, SchedulerCommand, SchedulerError, SchedulerState, TriggerInfo};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command and wait for its response.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        self.send_command(build_command, operation).await?
    }

    /// Run a DAG now, outside its schedule.
    ///
    /// Returns as soon as the run has been started.
    pub async fn trigger(&self, dag_id: impl Into<DagId>) -> Result<DagExecutionId, SchedulerError> {
        let dag_id = dag_id.into();
        self.send_result_command(
            |response| SchedulerCommand::Trigger { dag_id, response },
            "trigger",
        )
        .await
    }

    /// Reconcile the triggers with the definition store now.
    pub async fn refresh(&self) -> Result<ReconcileReport, SchedulerError> {
        self.send_result_command(|response| SchedulerCommand::Refresh { response }, "refresh")
            .await
    }

    /// Snapshot of the registered triggers.
    pub async fn triggers(&self) -> Result<Vec<TriggerInfo>, SchedulerError> {
        self.send_command(|response| SchedulerCommand::Triggers { response }, "triggers")
            .await
    }

    /// Number of DAG runs currently in flight.
    pub async fn running_count(&self) -> Result<usize, SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::RunningCount { response },
            "running_count",
        )
        .await
    }

    /// Shutdown the scheduler, waiting for in-flight runs up to its timeout.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}
