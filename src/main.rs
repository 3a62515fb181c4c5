//! cadence - cron-driven DAG scheduler.
//!
//! Usage:
//!   cadence run [--config FILE]               Run the scheduler
//!   cadence list [--config FILE]              List enabled DAGs and their next fire time
//!   cadence validate [--config FILE]          Check every enabled DAG's cron expression
//!   cadence trigger <DAG_ID> [--config FILE]  Run one DAG once and print the record
//!
//! The definition and execution store is addressed by the
//! `CADENCE_STORE_ENDPOINT` and `CADENCE_STORE_API_KEY` environment variables.

use cadence::{
    DagExecutor, DataApiStore, DefinitionStore, Event, EventBus, EventHandler, ExecutionError,
    ExecutionStatus, HttpInvoker, RetryingStore, Schedule, Scheduler, Settings,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// cadence - cron-driven DAG scheduler for HTTP-callable tasks
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Path to a YAML settings file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List enabled DAGs with their next fire time
    List {
        /// Path to a YAML settings file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Validate the cron expressions of all enabled DAGs
    Validate {
        /// Path to a YAML settings file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Run a DAG once and print the resulting execution record
    Trigger {
        /// DAG ID to run
        #[arg(value_name = "DAG_ID")]
        dag_id: String,

        /// Path to a YAML settings file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Event handler that logs lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::DagStarted {
                dag_id,
                execution_id,
                ..
            } => {
                info!("DAG '{}' started (execution: {})", dag_id, execution_id);
            }
            Event::DagCompleted {
                dag_id,
                execution_id,
                status,
                duration,
                ..
            } => {
                if *status == ExecutionStatus::Success {
                    info!(
                        "DAG '{}' succeeded in {:?} (execution: {})",
                        dag_id, duration, execution_id
                    );
                } else {
                    error!(
                        "DAG '{}' {} after {:?} (execution: {})",
                        dag_id, status, duration, execution_id
                    );
                }
            }
            Event::TaskStarted {
                task_id, attempt, ..
            } => {
                info!("  Task '{}' started (attempt {})", task_id, attempt);
            }
            Event::TaskSucceeded {
                task_id, attempts, ..
            } => {
                info!("  Task '{}' succeeded after {} attempt(s)", task_id, attempts);
            }
            Event::TaskRetrying {
                task_id,
                attempt,
                max_attempts,
                error,
                ..
            } => {
                warn!(
                    "  Task '{}' attempt {}/{} failed, retrying: {}",
                    task_id, attempt, max_attempts, error
                );
            }
            Event::TaskFailed {
                task_id,
                attempts,
                error,
                ..
            } => {
                warn!(
                    "  Task '{}' failed after {} attempt(s): {}",
                    task_id, attempts, error
                );
            }
            Event::TriggersReconciled {
                added,
                updated,
                removed,
                rejected,
                ..
            } => {
                info!(
                    "Triggers reconciled: {} added, {} updated, {} removed, {} rejected",
                    added, updated, removed, rejected
                );
            }
            Event::TriggerSkipped { dag_id, .. } => {
                warn!("DAG '{}' still running, skipping this fire", dag_id);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_scheduler(load_settings(config)?).await?;
        }
        Commands::List { config } => {
            list_dags(load_settings(config)?).await?;
        }
        Commands::Validate { config } => {
            validate_dags(load_settings(config)?).await?;
        }
        Commands::Trigger { dag_id, config } => {
            trigger_dag(load_settings(config)?, dag_id).await?;
        }
    }

    Ok(())
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings, Box<dyn std::error::Error>> {
    match Settings::load(path.as_deref()) {
        Ok(settings) => Ok(settings),
        Err(e) => {
            error!("Configuration error: {}", e);
            Err(e.into())
        }
    }
}

fn build_store(
    settings: &Settings,
) -> Result<Arc<RetryingStore<DataApiStore>>, Box<dyn std::error::Error>> {
    let store = DataApiStore::new(settings.data_api_options())?;
    Ok(Arc::new(RetryingStore::new(
        store,
        settings.store.persistence_backoff.clone(),
    )))
}

fn build_executor(
    settings: &Settings,
    store: Arc<RetryingStore<DataApiStore>>,
    event_bus: Arc<EventBus>,
) -> Result<DagExecutor, Box<dyn std::error::Error>> {
    let invoker = HttpInvoker::new(settings.execution.invoker_options())?;
    Ok(DagExecutor::from_parts(Arc::new(invoker), store)
        .with_retry_delay(settings.execution.retry_delay())
        .with_event_bus(event_bus))
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using store at {}", settings.store_endpoint);

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let store = build_store(&settings)?;
    let executor = build_executor(&settings, store, event_bus.clone())?;

    // Fetch failures back off in the scheduler, so definitions skip the retry wrapper.
    let definitions = Arc::new(DataApiStore::new(settings.data_api_options())?);

    let scheduler = Scheduler::new(definitions, executor)
        .with_event_bus(event_bus)
        .with_tick_interval(settings.scheduler.tick_interval())
        .with_refresh_interval(settings.scheduler.refresh_interval())
        .with_fetch_backoff(settings.scheduler.definition_fetch_backoff.clone())
        .with_overlap_policy(settings.scheduler.overlap)
        .with_shutdown_timeout(settings.scheduler.shutdown_timeout());

    info!(
        "Starting scheduler (tick: {:?}, refresh: {:?})...",
        settings.scheduler.tick_interval(),
        settings.scheduler.refresh_interval()
    );
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    Ok(())
}

/// List enabled DAGs with their next fire time.
async fn list_dags(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&settings)?;
    let dags = store.fetch_enabled_dags().await?;

    if dags.is_empty() {
        println!("No enabled DAGs");
        return Ok(());
    }

    for dag in &dags {
        println!("ID: {}", dag.id);
        println!("  Name: {}", dag.name);
        println!("  Cron: {}", dag.cron);
        match Schedule::new(&dag.cron).and_then(|s| s.next()) {
            Ok(next) => println!("  Next fire: {}", next.to_rfc3339()),
            Err(e) => println!("  Next fire: none ({})", e),
        }
        println!("  Tasks: {}", dag.tasks.len());
        for task in &dag.tasks {
            if task.retry_on_failure {
                println!(
                    "    - {} -> {} (retries: {})",
                    task.name, task.endpoint, task.max_retries
                );
            } else {
                println!("    - {} -> {}", task.name, task.endpoint);
            }
        }
        println!();
    }

    Ok(())
}

/// Validate the cron expression of every enabled DAG.
async fn validate_dags(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&settings)?;
    let dags = store.fetch_enabled_dags().await?;

    let mut invalid = 0usize;
    for dag in &dags {
        match Schedule::new(&dag.cron) {
            Ok(_) => info!("  - {} ({}): OK", dag.id, dag.name),
            Err(e) => {
                error!("  - {} ({}): {}", dag.id, dag.name, e);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        return Err(format!("{} of {} DAG(s) are invalid", invalid, dags.len()).into());
    }

    info!("All {} DAG(s) are valid", dags.len());
    Ok(())
}

/// Run a DAG once and print the final execution record as JSON.
async fn trigger_dag(settings: Settings, dag_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&settings)?;
    let dags = store.fetch_enabled_dags().await?;

    let Some(dag) = dags.into_iter().find(|d| d.id.as_str() == dag_id) else {
        error!("DAG '{}' not found among enabled DAGs", dag_id);
        return Err(format!("DAG '{}' not found", dag_id).into());
    };

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;
    let executor = build_executor(&settings, store, event_bus)?;

    match executor.run_dag(&dag).await {
        Ok(execution) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            if execution.status != ExecutionStatus::Success {
                return Err(format!("DAG '{}' finished with status {}", dag_id, execution.status).into());
            }
            Ok(())
        }
        Err(ExecutionError::Persistence { execution, source }) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            error!("Failed to persist final record: {}", source);
            Err(source.into())
        }
        Err(e) => Err(e.into()),
    }
}
