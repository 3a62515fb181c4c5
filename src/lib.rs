//! cadence - a cron-driven DAG scheduler for HTTP-callable tasks.
//!
//! DAG definitions are read from a definition store, each enabled DAG gets a
//! cron trigger, and every fire runs the DAG's tasks in order with per-task
//! retries. Execution lineage is written to an execution store as it happens.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, Settings};
pub use core::definition::{DagDefinition, TaskDefinition};
pub use core::execution::{DagExecution, ExecutionStatus, StateError, TaskExecution};
pub use core::retry::{Backoff, RetryPolicy};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{DagExecutionId, DagId, TaskExecutionId, TaskId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    DagExecutor, ExecutionError, HttpInvoker, HttpInvokerOptions, InvocationError, TaskInvoker,
    TaskRunner,
};
pub use scheduler::{
    OverlapPolicy, ReconcileReport, Scheduler, SchedulerError, SchedulerHandle, SchedulerState,
    TriggerInfo, TriggerRegistry,
};
pub use storage::{
    DataApiOptions, DataApiStore, DefinitionStore, ExecutionStore, InMemoryStore, RetryingStore,
    StorageError,
};
