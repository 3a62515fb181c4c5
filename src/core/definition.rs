//! DAG and task definitions.
//!
//! Definitions are authored outside the scheduler and read as immutable
//! snapshots from the definition store. The engine never mutates them.

use serde::{Deserialize, Serialize};

use super::types::{DagId, TaskId};

/// One HTTP-callable unit of work with its own retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task identifier.
    #[serde(rename = "uuid")]
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Endpoint called once per attempt.
    pub endpoint: String,
    /// Whether a failed attempt is retried.
    #[serde(default)]
    pub retry_on_failure: bool,
    /// Declared attempt ceiling, clamped by the system ceiling.
    #[serde(default)]
    pub max_retries: u32,
}

impl TaskDefinition {
    /// Create a task that is not retried.
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            retry_on_failure: false,
            max_retries: 0,
        }
    }

    /// Builder: enable retries up to `max_retries` attempts.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = max_retries;
        self
    }
}

/// A named, ordered chain of tasks scheduled under one cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagDefinition {
    /// DAG identifier.
    #[serde(rename = "uuid")]
    pub id: DagId,
    /// Human-readable name.
    pub name: String,
    /// Six-field cron expression (seconds resolution, UTC).
    pub cron: String,
    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Whether the DAG is scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl DagDefinition {
    /// Create an enabled DAG with no tasks.
    pub fn new(id: impl Into<DagId>, name: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cron: cron.into(),
            tasks: Vec::new(),
            enabled: true,
        }
    }

    /// Builder: append a task to the end of the chain.
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Builder: set enabled status.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Look up a task by its identifier.
    pub fn get_task(&self, id: &TaskId) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}
