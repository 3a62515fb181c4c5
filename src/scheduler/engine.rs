//! Scheduler loop.
//!
//! A single task owns the trigger registry and multiplexes four sources:
//! the fire tick (evaluate cron triggers), the refresh tick (start a
//! definition fetch), the completion of that fetch (reconcile with its
//! result) and commands from [`SchedulerHandle`]s. Fetches and fired runs
//! each live on their own tokio task, so neither a slow definition store nor
//! a long run delays the fire tick, and a refresh never touches a run in
//! flight.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::registry::TriggerRegistry;
use super::types::{OverlapPolicy, ReconcileReport, SchedulerCommand, SchedulerError, SchedulerState};
use crate::core::definition::DagDefinition;
use crate::core::retry::Backoff;
use crate::core::types::{DagExecutionId, DagId};
use crate::events::{Event, EventBus};
use crate::execution::{DagExecutor, ExecutionError};
use crate::storage::{DefinitionStore, StorageError};

type FetchResult = Result<Vec<DagDefinition>, StorageError>;
type RefreshReply = oneshot::Sender<Result<ReconcileReport, SchedulerError>>;

struct RunningDag {
    dag_id: DagId,
    handle: JoinHandle<()>,
}

/// Cron scheduler for DAGs read from a definition store.
pub struct Scheduler<D: DefinitionStore> {
    /// Source of enabled DAG definitions.
    definitions: Arc<D>,
    /// Executor for fired runs.
    executor: Arc<DagExecutor>,
    /// Event bus for scheduler events.
    event_bus: Arc<EventBus>,
    /// Live triggers.
    registry: TriggerRegistry,
    /// Interval for evaluating triggers.
    tick_interval: Duration,
    /// Interval for reconciling with the definition store.
    refresh_interval: Duration,
    /// Backoff applied to failing scheduled refreshes.
    fetch_backoff: Backoff,
    /// Consecutive failed definition fetches.
    fetch_failures: u32,
    /// Scheduled refreshes are skipped until this instant.
    refresh_not_before: Option<Instant>,
    /// Definition fetch in flight. At most one at a time.
    pending_fetch: Option<JoinHandle<FetchResult>>,
    /// Manual refreshes answered by the fetch in flight.
    fetch_waiters: Vec<RefreshReply>,
    /// Manual refreshes that need a fetch started after they arrived.
    queued_waiters: Vec<RefreshReply>,
    /// Same-DAG overlap policy.
    overlap: OverlapPolicy,
    /// Runs in flight.
    running: HashMap<DagExecutionId, RunningDag>,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
}

impl<D: DefinitionStore + 'static> Scheduler<D> {
    /// Create a scheduler with default cadences.
    pub fn new(definitions: Arc<D>, executor: DagExecutor) -> Self {
        Self {
            definitions,
            executor: Arc::new(executor),
            event_bus: Arc::new(EventBus::new()),
            registry: TriggerRegistry::new(),
            tick_interval: Duration::from_millis(250),
            refresh_interval: Duration::from_secs(1),
            fetch_backoff: Backoff::default(),
            fetch_failures: 0,
            refresh_not_before: None,
            pending_fetch: None,
            fetch_waiters: Vec::new(),
            queued_waiters: Vec::new(),
            overlap: OverlapPolicy::Allow,
            running: HashMap::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the event bus for scheduler events.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the fire tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the reconciliation interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the backoff for failing scheduled refreshes.
    pub fn with_fetch_backoff(mut self, backoff: Backoff) -> Self {
        self.fetch_backoff = backoff;
        self
    }

    /// Set the same-DAG overlap policy.
    pub fn with_overlap_policy(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Load the initial triggers and start the loop.
    ///
    /// Fails if the initial definition fetch fails.
    pub async fn start(mut self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let report = self.reconcile().await?;
        tracing::info!(
            triggers = self.registry.len(),
            rejected = report.rejected.len(),
            "Scheduler loaded dag definitions"
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        Ok((handle, scheduler_task))
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut fire = tokio::time::interval(self.tick_interval);
        fire.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh =
            tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = fire.tick() => {
                    self.fire_due_triggers().await;
                    self.reap_finished().await;
                }

                _ = refresh.tick() => {
                    self.scheduled_refresh();
                }

                fetched = next_fetch(&mut self.pending_fetch), if self.pending_fetch.is_some() => {
                    self.pending_fetch = None;
                    self.fetch_completed(fetched).await;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Trigger { dag_id, response } => {
                            let result = self.trigger_dag(&dag_id).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Refresh { response } => {
                            self.request_refresh(response);
                        }
                        SchedulerCommand::Triggers { response } => {
                            let _ = response.send(self.registry.snapshot(Utc::now()));
                        }
                        SchedulerCommand::RunningCount { response } => {
                            self.reap_finished().await;
                            let _ = response.send(self.running.len());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            let mut s = state.write().await;
                            *s = SchedulerState::Stopped;
                            drop(s);

                            if let Some(fetch) = self.pending_fetch.take() {
                                fetch.abort();
                            }
                            self.await_running_dags().await;

                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Fetch definitions and synchronize the registry with them.
    ///
    /// Only used at startup, before the loop runs.
    async fn reconcile(&mut self) -> Result<ReconcileReport, SchedulerError> {
        let dags = self.definitions.fetch_enabled_dags().await?;
        Ok(self.apply(dags).await)
    }

    /// Synchronize the registry with a fetched definition set.
    async fn apply(&mut self, dags: Vec<DagDefinition>) -> ReconcileReport {
        let report = self.registry.reconcile(dags, Utc::now());

        if report.has_changes() {
            tracing::info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                rejected = report.rejected.len(),
                "Triggers reconciled"
            );
            self.event_bus
                .emit(Event::triggers_reconciled(
                    report.added.len(),
                    report.updated.len(),
                    report.removed.len(),
                    report.rejected.len(),
                ))
                .await;
        }
        report
    }

    /// Spawn a definition fetch off the loop.
    fn start_fetch(&mut self) {
        let definitions = Arc::clone(&self.definitions);
        self.pending_fetch = Some(tokio::spawn(async move {
            definitions.fetch_enabled_dags().await
        }));
    }

    /// Periodic reconciliation. Skipped while a fetch is in flight or backing off.
    fn scheduled_refresh(&mut self) {
        if self.pending_fetch.is_some() {
            return;
        }
        if self
            .refresh_not_before
            .is_some_and(|not_before| Instant::now() < not_before)
        {
            return;
        }
        self.start_fetch();
    }

    /// Reconcile on demand.
    ///
    /// A fetch already in flight may have read the store before this
    /// request, so the reply waits for a fresh one.
    fn request_refresh(&mut self, response: RefreshReply) {
        if self.pending_fetch.is_some() {
            self.queued_waiters.push(response);
        } else {
            self.fetch_waiters.push(response);
            self.start_fetch();
        }
    }

    /// Apply a finished fetch. Failures keep the current triggers.
    async fn fetch_completed(&mut self, fetched: FetchResult) {
        let waiters = std::mem::take(&mut self.fetch_waiters);

        match fetched {
            Ok(dags) => {
                let report = self.apply(dags).await;
                if self.fetch_failures > 0 {
                    tracing::info!(
                        failures = self.fetch_failures,
                        "Definition store reachable again"
                    );
                }
                self.fetch_failures = 0;
                self.refresh_not_before = None;
                for waiter in waiters {
                    let _ = waiter.send(Ok(report.clone()));
                }
            }
            Err(e) => {
                self.fetch_failures = self.fetch_failures.saturating_add(1);
                let delay = self.fetch_backoff.delay_for(self.fetch_failures);
                self.refresh_not_before = Some(Instant::now() + delay);
                tracing::warn!(
                    error = %e,
                    failures = self.fetch_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    triggers = self.registry.len(),
                    "Failed to refresh dag definitions, keeping current triggers"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(SchedulerError::DefinitionFetch(e.clone())));
                }
            }
        }

        if !self.queued_waiters.is_empty() {
            self.fetch_waiters = std::mem::take(&mut self.queued_waiters);
            self.start_fetch();
        }
    }

    /// Launch every trigger that is due.
    async fn fire_due_triggers(&mut self) {
        let now = Utc::now();
        for dag in self.registry.due(now) {
            if self.overlap == OverlapPolicy::Skip && self.is_running(&dag.id) {
                tracing::info!(dag = %dag.id, "Skipping fire, previous run still in flight");
                self.event_bus
                    .emit(Event::trigger_skipped(dag.id.clone()))
                    .await;
                continue;
            }
            tracing::info!(dag = %dag.id, "Triggering scheduled dag");
            self.launch(dag);
        }
    }

    /// Start a run of a registered DAG on demand.
    async fn trigger_dag(&mut self, dag_id: &DagId) -> Result<DagExecutionId, SchedulerError> {
        let dag = self
            .registry
            .get(dag_id)
            .ok_or_else(|| SchedulerError::DagNotFound(dag_id.to_string()))?;

        if self.overlap == OverlapPolicy::Skip {
            self.reap_finished().await;
            if self.is_running(dag_id) {
                return Err(SchedulerError::AlreadyRunning(dag_id.to_string()));
            }
        }

        tracing::info!(dag = %dag_id, "Triggering dag manually");
        Ok(self.launch(dag))
    }

    fn is_running(&self, dag_id: &DagId) -> bool {
        self.running
            .values()
            .any(|r| &r.dag_id == dag_id && !r.handle.is_finished())
    }

    /// Spawn one run of `dag` and track it.
    fn launch(&mut self, dag: Arc<DagDefinition>) -> DagExecutionId {
        let execution = self.executor.prepare(&dag);
        let execution_id = execution.id.clone();
        let executor = Arc::clone(&self.executor);
        let dag_id = dag.id.clone();

        let handle = tokio::spawn(async move {
            match executor.execute(&dag, execution).await {
                Ok(done) => {
                    tracing::info!(
                        dag = %done.dag_id,
                        execution = %done.id,
                        status = %done.status,
                        "DAG run finished"
                    );
                }
                Err(ExecutionError::Persistence { execution, source }) => {
                    tracing::error!(
                        dag = %execution.dag_id,
                        execution = %execution.id,
                        status = %execution.status,
                        error = %source,
                        "DAG run finished but its final state was not persisted"
                    );
                }
                Err(e) => {
                    tracing::error!(dag = %dag.id, error = %e, "DAG run aborted");
                }
            }
        });

        self.running
            .insert(execution_id.clone(), RunningDag { dag_id, handle });
        execution_id
    }

    /// Drop finished runs, reporting any that panicked.
    async fn reap_finished(&mut self) {
        let finished: Vec<DagExecutionId> = self
            .running
            .iter()
            .filter(|(_, r)| r.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished {
            let Some(run) = self.running.remove(&id) else {
                continue;
            };
            if let Err(e) = run.handle.await {
                tracing::error!(
                    dag = %run.dag_id,
                    execution = %id,
                    error = %e,
                    "DAG run panicked"
                );
            }
        }
    }

    /// Wait for all running DAGs to complete with a timeout.
    async fn await_running_dags(&mut self) {
        self.reap_finished().await;
        let running_count = self.running.len();

        if running_count == 0 {
            tracing::info!("No running dags to wait for during shutdown");
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running dag(s) to complete (timeout: {:?})",
            running_count,
            self.shutdown_timeout
        );

        let start = Instant::now();
        let deadline = start + self.shutdown_timeout;

        loop {
            self.reap_finished().await;
            let remaining = self.running.len();

            if remaining == 0 {
                tracing::info!("All running dags completed gracefully in {:?}", start.elapsed());
                break;
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} dag(s) still running",
                    self.shutdown_timeout,
                    remaining
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Resolve the fetch in flight. Never resolves when there is none.
async fn next_fetch(pending: &mut Option<JoinHandle<FetchResult>>) -> FetchResult {
    match pending {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(StorageError::Other(format!(
                "definition fetch task failed: {}",
                e
            ))),
        },
        None => std::future::pending().await,
    }
}
