//! Persisted execution records.
//!
//! A [`DagExecution`] is created every time a trigger fires and holds one
//! [`TaskExecution`] per task attempted so far. Retries of a task reuse its
//! record and bump the attempt counter in place.
//!
//! All timestamps are milliseconds since the Unix epoch.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::definition::{DagDefinition, TaskDefinition};
use super::types::{DagExecutionId, DagId, TaskExecutionId, TaskId};

/// Current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Breach of an execution state machine contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// A terminal record was mutated.
    #[error("{record} {id} is already terminal ({status})")]
    AlreadyTerminal {
        record: &'static str,
        id: String,
        status: ExecutionStatus,
    },

    /// An attempt was started beyond the effective ceiling.
    #[error("task execution {id} would exceed its attempt ceiling of {ceiling}")]
    AttemptCeilingExceeded { id: TaskExecutionId, ceiling: u32 },

    /// Success was declared while some task had not succeeded.
    #[error("dag execution {id} has task {task} in status {status}")]
    IncompleteTask {
        id: DagExecutionId,
        task: TaskExecutionId,
        status: ExecutionStatus,
    },

    /// The referenced task execution is not part of the run.
    #[error("task execution {task} is not recorded in dag execution {id}")]
    UnknownTaskExecution {
        id: DagExecutionId,
        task: TaskExecutionId,
    },

    /// The referenced task execution has not failed.
    #[error("task execution {task} is {status}, not failed")]
    TaskNotFailed {
        task: TaskExecutionId,
        status: ExecutionStatus,
    },
}

/// Status of a DAG or task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// In progress.
    Running,
    /// Completed successfully.
    Success,
    /// Completed with failure.
    Failed,
}

impl ExecutionStatus {
    /// Whether this status ends the record's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// All attempts of one task within one DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    #[serde(rename = "uuid")]
    pub id: TaskExecutionId,
    pub name: String,
    #[serde(rename = "dag_uuid")]
    pub dag_execution_id: DagExecutionId,
    #[serde(rename = "task_uuid")]
    pub task_id: TaskId,
    pub attempts: u32,
    pub status: ExecutionStatus,
    pub start: i64,
    pub end: Option<i64>,
    /// Failure detail of the latest attempt. Encoded as `""` when absent.
    #[serde(with = "empty_as_none", default)]
    pub error: Option<String>,
}

impl TaskExecution {
    /// Create a record for a task that has not been attempted yet.
    pub fn new(dag_execution_id: DagExecutionId, task: &TaskDefinition) -> Self {
        Self {
            id: TaskExecutionId::new(),
            name: task.name.clone(),
            dag_execution_id,
            task_id: task.id.clone(),
            attempts: 0,
            status: ExecutionStatus::Running,
            start: now_millis(),
            end: None,
            error: None,
        }
    }

    /// Start another attempt, re-opening a failed record.
    ///
    /// A succeeded record can never be re-opened, and the attempt counter
    /// never passes `ceiling`.
    pub fn begin_attempt(&mut self, ceiling: u32) -> Result<(), StateError> {
        if self.status == ExecutionStatus::Success {
            return Err(StateError::AlreadyTerminal {
                record: "task execution",
                id: self.id.to_string(),
                status: self.status,
            });
        }
        if self.attempts >= ceiling {
            return Err(StateError::AttemptCeilingExceeded {
                id: self.id.clone(),
                ceiling,
            });
        }
        self.attempts += 1;
        self.status = ExecutionStatus::Running;
        self.end = None;
        self.error = None;
        Ok(())
    }

    /// Mark the current attempt as succeeded.
    pub fn mark_success(&mut self) {
        self.status = ExecutionStatus::Success;
        self.end = Some(now_millis());
        self.error = None;
    }

    /// Mark the current attempt as failed with the given detail.
    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.end = Some(now_millis());
        self.error = Some(detail.into());
    }

    /// Duration of the record in milliseconds, if it has ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| end - self.start)
    }
}

/// One run of a DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagExecution {
    #[serde(rename = "uuid")]
    pub id: DagExecutionId,
    pub name: String,
    #[serde(rename = "dag_uuid")]
    pub dag_id: DagId,
    pub status: ExecutionStatus,
    /// Set only when the run failed. Encoded as `""` when absent.
    #[serde(
        rename = "failing_task_execution_uuid",
        with = "empty_as_none",
        default
    )]
    pub failing_task_execution_id: Option<TaskExecutionId>,
    #[serde(default)]
    pub task_executions: Vec<TaskExecution>,
    pub start: i64,
    pub end: Option<i64>,
}

impl DagExecution {
    /// Create a fresh running record for one fire of `dag`.
    pub fn new(dag: &DagDefinition) -> Self {
        Self {
            id: DagExecutionId::new(),
            name: dag.name.clone(),
            dag_id: dag.id.clone(),
            status: ExecutionStatus::Running,
            failing_task_execution_id: None,
            task_executions: Vec::new(),
            start: now_millis(),
            end: None,
        }
    }

    fn ensure_running(&self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::AlreadyTerminal {
                record: "dag execution",
                id: self.id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Append a task record, or replace the entry with the same id.
    pub fn record_task(&mut self, task_execution: TaskExecution) -> Result<(), StateError> {
        self.ensure_running()?;
        match self
            .task_executions
            .iter_mut()
            .find(|te| te.id == task_execution.id)
        {
            Some(existing) => *existing = task_execution,
            None => self.task_executions.push(task_execution),
        }
        Ok(())
    }

    /// Look up the entry for a task.
    pub fn task_execution(&self, task_id: &TaskId) -> Option<&TaskExecution> {
        self.task_executions.iter().find(|te| &te.task_id == task_id)
    }

    /// Close the run as succeeded. Every recorded task must have succeeded.
    pub fn mark_success(&mut self) -> Result<(), StateError> {
        self.ensure_running()?;
        if let Some(te) = self
            .task_executions
            .iter()
            .find(|te| te.status != ExecutionStatus::Success)
        {
            return Err(StateError::IncompleteTask {
                id: self.id.clone(),
                task: te.id.clone(),
                status: te.status,
            });
        }
        self.status = ExecutionStatus::Success;
        self.end = Some(now_millis());
        Ok(())
    }

    /// Close the run as failed at the given task execution.
    pub fn mark_failed(&mut self, failing: &TaskExecutionId) -> Result<(), StateError> {
        self.ensure_running()?;
        let te = self
            .task_executions
            .iter()
            .find(|te| &te.id == failing)
            .ok_or_else(|| StateError::UnknownTaskExecution {
                id: self.id.clone(),
                task: failing.clone(),
            })?;
        if te.status != ExecutionStatus::Failed {
            return Err(StateError::TaskNotFailed {
                task: failing.clone(),
                status: te.status,
            });
        }
        self.status = ExecutionStatus::Failed;
        self.failing_task_execution_id = Some(failing.clone());
        self.end = Some(now_millis());
        Ok(())
    }

    /// The failing task record, if the run failed.
    pub fn failing_task(&self) -> Option<&TaskExecution> {
        let id = self.failing_task_execution_id.as_ref()?;
        self.task_executions.iter().find(|te| &te.id == id)
    }
}

/// Encodes `None` as the empty string and decodes `""` (or `null`) as `None`.
mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}
