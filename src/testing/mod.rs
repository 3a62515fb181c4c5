//! Testing utilities for users of the cadence library.
//!
//! This module provides helpers for exercising the engine without network
//! access:
//!
//! - [`ScriptedInvoker`]: a task invoker answering from per-endpoint scripts
//! - [`FlakyStore`]: a store wrapper that fails or stalls on demand
//! - [`RecordingHandler`]: an event handler that keeps every event

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::definition::{DagDefinition, TaskDefinition};
use crate::core::execution::{DagExecution, TaskExecution};
use crate::events::{Event, EventHandler};
use crate::execution::{InvocationError, TaskInvoker};
use crate::storage::{DefinitionStore, ExecutionStore, InMemoryStore, StorageError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of one scripted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(InvocationError),
}

impl Outcome {
    /// A non-2xx response with the given body.
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Outcome::Failure(InvocationError::Status {
            status,
            body: body.into(),
        })
    }

    /// A transport error with the given text.
    pub fn transport(message: impl Into<String>) -> Self {
        Outcome::Failure(InvocationError::Transport(message.into()))
    }
}

#[derive(Default)]
struct Script {
    queued: VecDeque<Outcome>,
    fallback: Option<Outcome>,
    calls: usize,
}

/// Task invoker answering from per-endpoint scripts.
///
/// Each endpoint first consumes its queued outcomes, then repeats its
/// fallback outcome, which defaults to success.
///
/// # Example
///
/// ```
/// use cadence::testing::{Outcome, ScriptedInvoker};
///
/// let invoker = ScriptedInvoker::new();
/// invoker.script("http://svc/flaky", vec![Outcome::status(503, ""), Outcome::Success]);
/// invoker.set_default("http://svc/down", Outcome::transport("connection refused"));
/// ```
#[derive(Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, Script>>,
    latency: Mutex<Duration>,
    total: AtomicUsize,
}

impl ScriptedInvoker {
    /// Create an invoker where every endpoint succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = latency;
        self
    }

    /// Queue outcomes for the next calls to `endpoint`.
    pub fn script(&self, endpoint: &str, outcomes: Vec<Outcome>) {
        let mut scripts = lock(&self.scripts);
        scripts
            .entry(endpoint.to_string())
            .or_default()
            .queued
            .extend(outcomes);
    }

    /// Outcome of `endpoint` once its queue is exhausted.
    pub fn set_default(&self, endpoint: &str, outcome: Outcome) {
        let mut scripts = lock(&self.scripts);
        scripts.entry(endpoint.to_string()).or_default().fallback = Some(outcome);
    }

    /// Number of calls made to `endpoint`.
    pub fn calls(&self, endpoint: &str) -> usize {
        lock(&self.scripts).get(endpoint).map_or(0, |s| s.calls)
    }

    /// Number of calls made to any endpoint.
    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, endpoint: &str) -> Outcome {
        let mut scripts = lock(&self.scripts);
        let script = scripts.entry(endpoint.to_string()).or_default();
        script.calls += 1;
        script
            .queued
            .pop_front()
            .or_else(|| script.fallback.clone())
            .unwrap_or(Outcome::Success)
    }
}

#[async_trait]
impl TaskInvoker for ScriptedInvoker {
    async fn invoke(&self, task: &TaskDefinition) -> Result<(), InvocationError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome(&task.endpoint);

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match outcome {
            Outcome::Success => Ok(()),
            Outcome::Failure(err) => Err(err),
        }
    }
}

/// Store wrapper that fails or stalls on demand, delegating to an [`InMemoryStore`].
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    fail_next: AtomicU32,
    fail_terminal_dag_writes: AtomicBool,
    fetch_latency: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FlakyStore {
    /// Wrap `inner` without injecting failures.
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            fail_terminal_dag_writes: AtomicBool::new(false),
            fetch_latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    /// Builder: fail the next `n` calls of any kind.
    pub fn fail_next(self, n: u32) -> Self {
        self.set_fail_next(n);
        self
    }

    /// Builder: always fail writes of terminal DAG executions.
    pub fn fail_terminal_dag_writes(self) -> Self {
        self.fail_terminal_dag_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` calls of any kind, starting now.
    pub fn set_fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Hold every definition fetch for `latency` after it reads the
    /// wrapped store, starting now.
    pub fn set_fetch_latency(&self, latency: Duration) {
        *lock(&self.fetch_latency) = latency;
    }

    /// Number of calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    fn check(&self, operation: &str) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Other(format!("injected failure in {}", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for FlakyStore {
    async fn fetch_enabled_dags(&self) -> Result<Vec<DagDefinition>, StorageError> {
        self.check("fetch_enabled_dags")?;
        let dags = self.inner.fetch_enabled_dags().await?;
        let latency = *lock(&self.fetch_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(dags)
    }
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn upsert_dag_execution(&self, execution: &DagExecution) -> Result<(), StorageError> {
        self.check("upsert_dag_execution")?;
        if execution.status.is_terminal() && self.fail_terminal_dag_writes.load(Ordering::SeqCst)
        {
            return Err(StorageError::Status {
                status: 503,
                body: "injected terminal write failure".to_string(),
            });
        }
        self.inner.upsert_dag_execution(execution).await
    }

    async fn upsert_task_execution(&self, execution: &TaskExecution) -> Result<(), StorageError> {
        self.check("upsert_task_execution")?;
        self.inner.upsert_task_execution(execution).await
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
