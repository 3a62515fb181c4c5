//! Store wrapper retrying failed calls with exponential backoff.

use async_trait::async_trait;
use std::future::Future;
use tracing::warn;

use super::{DefinitionStore, ExecutionStore, StorageError};
use crate::core::definition::DagDefinition;
use crate::core::execution::{DagExecution, TaskExecution};
use crate::core::retry::Backoff;

/// Wraps a store and retries every call according to a [`Backoff`].
///
/// Upserts are idempotent, so resending the same full record is safe.
pub struct RetryingStore<S> {
    inner: S,
    backoff: Backoff,
}

impl<S> RetryingStore<S> {
    /// Wrap `inner` with the given backoff.
    pub fn new(inner: S, backoff: Backoff) -> Self {
        Self { inner, backoff }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut failures = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if failures >= max_attempts {
                        return Err(err);
                    }
                    let delay = self.backoff.delay_for(failures);
                    warn!(
                        operation,
                        attempt = failures,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: DefinitionStore> DefinitionStore for RetryingStore<S> {
    async fn fetch_enabled_dags(&self) -> Result<Vec<DagDefinition>, StorageError> {
        self.retry("fetch_enabled_dags", || self.inner.fetch_enabled_dags())
            .await
    }
}

#[async_trait]
impl<S: ExecutionStore> ExecutionStore for RetryingStore<S> {
    async fn upsert_dag_execution(&self, execution: &DagExecution) -> Result<(), StorageError> {
        self.retry("upsert_dag_execution", || {
            self.inner.upsert_dag_execution(execution)
        })
        .await
    }

    async fn upsert_task_execution(&self, execution: &TaskExecution) -> Result<(), StorageError> {
        self.retry("upsert_task_execution", || {
            self.inner.upsert_task_execution(execution)
        })
        .await
    }
}
