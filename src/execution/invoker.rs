//! Outbound task calls.
//!
//! An invoker makes exactly one call per invocation. Retry policy lives one
//! layer up in the task runner.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::definition::TaskDefinition;

/// Why a task call did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// The task declares no endpoint.
    #[error("task has no endpoint")]
    EmptyEndpoint,

    /// The request could not be sent or its response read.
    #[error("{0}")]
    Transport(String),

    /// The endpoint answered outside the 2xx range.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The invoker itself could not be set up.
    #[error("invoker setup failed: {0}")]
    Client(String),
}

impl InvocationError {
    /// Failure detail recorded on the task execution.
    ///
    /// For non-2xx responses this is the response body, or `HTTP <code>`
    /// when the body is empty.
    pub fn detail(&self) -> String {
        match self {
            InvocationError::Status { status, body } if body.trim().is_empty() => {
                format!("HTTP {}", status)
            }
            InvocationError::Status { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Issues one call for one task attempt.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    /// Call the task's endpoint once.
    async fn invoke(&self, task: &TaskDefinition) -> Result<(), InvocationError>;
}

/// Settings for [`HttpInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpInvokerOptions {
    /// Value of the `Content-Type` header sent with every call.
    pub content_type: String,
    /// Per-call timeout. `None` means the call may block indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for HttpInvokerOptions {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            timeout: None,
        }
    }
}

/// Invoker issuing `GET <endpoint>` with no body.
pub struct HttpInvoker {
    client: Client,
    content_type: String,
}

impl HttpInvoker {
    /// Build an invoker with its own HTTP client.
    pub fn new(options: HttpInvokerOptions) -> Result<Self, InvocationError> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| InvocationError::Client(e.to_string()))?;
        Ok(Self {
            client,
            content_type: options.content_type,
        })
    }
}

#[async_trait]
impl TaskInvoker for HttpInvoker {
    async fn invoke(&self, task: &TaskDefinition) -> Result<(), InvocationError> {
        if task.endpoint.trim().is_empty() {
            return Err(InvocationError::EmptyEndpoint);
        }

        let response = self
            .client
            .get(&task.endpoint)
            .header(CONTENT_TYPE, &self.content_type)
            .send()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(task_id = %task.id, status = status.as_u16(), "task endpoint responded");

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(InvocationError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
