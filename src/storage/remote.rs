//! HTTP JSON data API backend.
//!
//! Definitions are read with `POST {endpoint}/find` and execution records are
//! written with `POST {endpoint}/upsert`, keyed by the record's `uuid`.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{DefinitionStore, ExecutionStore, StorageError};
use crate::core::definition::DagDefinition;
use crate::core::execution::{DagExecution, TaskExecution};

/// Connection settings for [`DataApiStore`].
#[derive(Debug, Clone)]
pub struct DataApiOptions {
    /// Base URL of the data API, without trailing slash.
    pub endpoint: String,
    /// Bearer token.
    pub api_key: SecretString,
    pub database: String,
    pub dags_collection: String,
    pub dag_executions_collection: String,
    pub task_executions_collection: String,
    /// Per-request timeout. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl DataApiOptions {
    /// Options with the default database and collection names.
    pub fn new(endpoint: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            database: "scheduler".to_string(),
            dags_collection: "dags".to_string(),
            dag_executions_collection: "dag_executions".to_string(),
            task_executions_collection: "task_executions".to_string(),
            timeout: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FindResponse {
    Bare(Vec<DagDefinition>),
    Wrapped { documents: Vec<DagDefinition> },
}

impl FindResponse {
    fn into_documents(self) -> Vec<DagDefinition> {
        match self {
            FindResponse::Bare(docs) => docs,
            FindResponse::Wrapped { documents } => documents,
        }
    }
}

/// Store backed by a remote JSON data API.
pub struct DataApiStore {
    client: Client,
    options: DataApiOptions,
}

impl DataApiStore {
    /// Build the store and its HTTP client.
    pub fn new(options: DataApiOptions) -> Result<Self, StorageError> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| StorageError::Other(format!("cannot build http client: {}", e)))?;
        let mut options = options;
        options.endpoint = options.endpoint.trim_end_matches('/').to_string();
        Ok(Self { client, options })
    }

    /// The resolved connection options.
    pub fn options(&self) -> &DataApiOptions {
        &self.options
    }

    async fn post(&self, action: &str, body: &Value) -> Result<String, StorageError> {
        let url = format!("{}/{}", self.options.endpoint, action);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.options.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(StorageError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn upsert<T: Serialize>(
        &self,
        collection: &str,
        id: String,
        record: &T,
    ) -> Result<(), StorageError> {
        let body = json!({
            "database": self.options.database,
            "collection": collection,
            "query": { "uuid": id },
            "update": { "$set": serde_json::to_value(record)? },
            "upsert": true,
        });
        debug!(collection, uuid = %id, "upserting record");
        self.post("upsert", &body).await?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for DataApiStore {
    async fn fetch_enabled_dags(&self) -> Result<Vec<DagDefinition>, StorageError> {
        let body = json!({
            "database": self.options.database,
            "collection": self.options.dags_collection,
            "query": { "enabled": true },
        });
        let text = self.post("find", &body).await?;
        let response: FindResponse = serde_json::from_str(&text)?;
        let dags = response.into_documents();
        debug!(count = dags.len(), "fetched enabled dag definitions");
        Ok(dags)
    }
}

#[async_trait]
impl ExecutionStore for DataApiStore {
    async fn upsert_dag_execution(&self, execution: &DagExecution) -> Result<(), StorageError> {
        self.upsert(
            &self.options.dag_executions_collection,
            execution.id.to_string(),
            execution,
        )
        .await
    }

    async fn upsert_task_execution(&self, execution: &TaskExecution) -> Result<(), StorageError> {
        self.upsert(
            &self.options.task_executions_collection,
            execution.id.to_string(),
            execution,
        )
        .await
    }
}
