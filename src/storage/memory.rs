//! In-memory store implementation.
//!
//! Provides a thread-safe backend for tests, benches and development. It
//! serves definitions like the remote store (enabled only, store order) and
//! keeps every execution write in order so tests can assert on history.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{DefinitionStore, ExecutionStore, StorageError};
use crate::core::definition::DagDefinition;
use crate::core::execution::{DagExecution, TaskExecution};
use crate::core::types::{DagExecutionId, DagId, TaskExecutionId};

/// One upsert as received by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Dag(DagExecution),
    Task(TaskExecution),
}

/// In-memory definition and execution store.
pub struct InMemoryStore {
    definitions: RwLock<Vec<DagDefinition>>,
    dag_executions: RwLock<HashMap<DagExecutionId, DagExecution>>,
    task_executions: RwLock<HashMap<TaskExecutionId, TaskExecution>>,
    writes: RwLock<Vec<StoreWrite>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            dag_executions: RwLock::new(HashMap::new()),
            task_executions: RwLock::new(HashMap::new()),
            writes: RwLock::new(Vec::new()),
        }
    }

    /// Create a store serving the given definitions.
    pub fn with_definitions(definitions: Vec<DagDefinition>) -> Self {
        let store = Self::new();
        store.set_definitions(definitions);
        store
    }

    /// Replace the whole definition set.
    pub fn set_definitions(&self, definitions: Vec<DagDefinition>) {
        *write(&self.definitions) = definitions;
    }

    /// Insert a definition, or replace the one with the same id in place.
    pub fn put_definition(&self, dag: DagDefinition) {
        let mut defs = write(&self.definitions);
        match defs.iter_mut().find(|d| d.id == dag.id) {
            Some(existing) => *existing = dag,
            None => defs.push(dag),
        }
    }

    /// Flip the enabled flag of a stored definition. Returns false if unknown.
    pub fn set_enabled(&self, id: &DagId, enabled: bool) -> bool {
        let mut defs = write(&self.definitions);
        match defs.iter_mut().find(|d| &d.id == id) {
            Some(dag) => {
                dag.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Latest stored version of a DAG execution.
    pub fn get_dag_execution(&self, id: &DagExecutionId) -> Option<DagExecution> {
        read(&self.dag_executions).get(id).cloned()
    }

    /// Latest stored version of a task execution.
    pub fn get_task_execution(&self, id: &TaskExecutionId) -> Option<TaskExecution> {
        read(&self.task_executions).get(id).cloned()
    }

    /// All stored executions of one DAG, oldest first.
    pub fn list_dag_executions(&self, dag_id: &DagId) -> Vec<DagExecution> {
        let mut result: Vec<_> = read(&self.dag_executions)
            .values()
            .filter(|e| &e.dag_id == dag_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.start);
        result
    }

    /// All stored task executions belonging to one DAG execution.
    pub fn list_task_executions(&self, dag_execution_id: &DagExecutionId) -> Vec<TaskExecution> {
        let mut result: Vec<_> = read(&self.task_executions)
            .values()
            .filter(|t| &t.dag_execution_id == dag_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|t| t.start);
        result
    }

    /// Every write received, in arrival order.
    pub fn write_log(&self) -> Vec<StoreWrite> {
        read(&self.writes).clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn fetch_enabled_dags(&self) -> Result<Vec<DagDefinition>, StorageError> {
        let defs = self
            .definitions
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(defs.iter().filter(|d| d.enabled).cloned().collect())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn upsert_dag_execution(&self, execution: &DagExecution) -> Result<(), StorageError> {
        let mut execs = self
            .dag_executions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut writes = self.writes.write().map_err(|_| StorageError::LockPoisoned)?;
        execs.insert(execution.id.clone(), execution.clone());
        writes.push(StoreWrite::Dag(execution.clone()));
        Ok(())
    }

    async fn upsert_task_execution(&self, execution: &TaskExecution) -> Result<(), StorageError> {
        let mut execs = self
            .task_executions
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut writes = self.writes.write().map_err(|_| StorageError::LockPoisoned)?;
        execs.insert(execution.id.clone(), execution.clone());
        writes.push(StoreWrite::Task(execution.clone()));
        Ok(())
    }
}
