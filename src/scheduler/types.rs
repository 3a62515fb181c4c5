//! Scheduler type definitions.
//!
//! This module contains error types, state enums, reports and command types
//! for the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::types::{DagExecutionId, DagId};
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Reading definitions from the definition store failed.
    #[error("failed to fetch dag definitions: {0}")]
    DefinitionFetch(#[from] StorageError),

    /// No trigger is registered for the DAG.
    #[error("dag not found: {0}")]
    DagNotFound(String),

    /// A run of the DAG is in flight and overlapping runs are not allowed.
    #[error("dag already running: {0}")]
    AlreadyRunning(String),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
}

/// What to do when a DAG's trigger fires while a run of it is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Start another, independent run.
    #[default]
    Allow,
    /// Skip this fire.
    Skip,
}

/// Outcome of synchronizing the trigger registry with a definition set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// DAGs that got a new trigger.
    pub added: Vec<DagId>,
    /// DAGs whose definition changed.
    pub updated: Vec<DagId>,
    /// DAGs whose trigger was removed.
    pub removed: Vec<DagId>,
    /// DAGs left untouched.
    pub unchanged: Vec<DagId>,
    /// DAGs not accepted, with the reason.
    pub rejected: Vec<(DagId, String)>,
}

impl ReconcileReport {
    /// Whether the registry changed or anything was rejected.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.rejected.is_empty())
    }
}

/// Snapshot of one registered trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub dag_id: DagId,
    pub name: String,
    pub cron: String,
    pub task_count: usize,
    pub next_fire: Option<DateTime<Utc>>,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run a DAG now.
    Trigger {
        dag_id: DagId,
        response: oneshot::Sender<Result<DagExecutionId, SchedulerError>>,
    },
    /// Reconcile with the definition store now.
    Refresh {
        response: oneshot::Sender<Result<ReconcileReport, SchedulerError>>,
    },
    /// List the registered triggers.
    Triggers {
        response: oneshot::Sender<Vec<TriggerInfo>>,
    },
    /// Count runs in flight.
    RunningCount { response: oneshot::Sender<usize> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
