//! Definition and execution stores.
//!
//! The engine reads enabled DAG definitions from a [`DefinitionStore`] and
//! mirrors every execution state transition to an [`ExecutionStore`] by
//! upsert. Backends: in-memory for tests and development, and an HTTP JSON
//! data API for production.

mod memory;
mod remote;
mod retrying;

pub use memory::{InMemoryStore, StoreWrite};
pub use remote::{DataApiOptions, DataApiStore};
pub use retrying::RetryingStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::definition::DagDefinition;
use crate::core::execution::{DagExecution, TaskExecution};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The request could not be sent or its response read.
    #[error("request failed: {0}")]
    Request(String),

    /// The store answered with a non-success status.
    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

/// Read-only source of DAG definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Fetch every DAG definition with `enabled = true`, in store order.
    async fn fetch_enabled_dags(&self) -> Result<Vec<DagDefinition>, StorageError>;
}

/// Write-mostly sink for execution records, keyed by record identifier.
///
/// Upserts must be idempotent: writing the same full record twice leaves the
/// store as if it had been written once.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a DAG execution.
    async fn upsert_dag_execution(&self, execution: &DagExecution) -> Result<(), StorageError>;

    /// Insert or replace a task execution.
    async fn upsert_task_execution(&self, execution: &TaskExecution) -> Result<(), StorageError>;
}
