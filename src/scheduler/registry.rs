//! Live cron trigger registry.
//!
//! One trigger per DAG, keyed by DAG id. The registry is owned by the
//! scheduler loop and only mutated through [`TriggerRegistry::reconcile`]
//! and [`TriggerRegistry::due`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{ReconcileReport, TriggerInfo};
use crate::core::definition::DagDefinition;
use crate::core::schedule::Schedule;
use crate::core::types::DagId;

/// Stop counting missed occurrences past this many.
const MAX_COUNT_ITERATIONS: usize = 100;

#[derive(Debug, Clone)]
struct Trigger {
    dag: Arc<DagDefinition>,
    schedule: Schedule,
    /// Occurrences at or before this instant have been handled.
    last_checked: DateTime<Utc>,
}

/// Cron triggers for the currently enabled DAGs.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    triggers: BTreeMap<DagId, Trigger>,
}

impl TriggerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered triggers.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether no trigger is registered.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Whether a trigger is registered for `dag_id`.
    pub fn contains(&self, dag_id: &DagId) -> bool {
        self.triggers.contains_key(dag_id)
    }

    /// The registered definition of `dag_id`.
    pub fn get(&self, dag_id: &DagId) -> Option<Arc<DagDefinition>> {
        self.triggers.get(dag_id).map(|t| Arc::clone(&t.dag))
    }

    /// Registered DAG ids, sorted.
    pub fn ids(&self) -> Vec<DagId> {
        self.triggers.keys().cloned().collect()
    }

    /// Snapshot of every trigger with its next fire time after `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<TriggerInfo> {
        self.triggers
            .values()
            .map(|t| TriggerInfo {
                dag_id: t.dag.id.clone(),
                name: t.dag.name.clone(),
                cron: t.schedule.expression().to_string(),
                task_count: t.dag.tasks.len(),
                next_fire: t.schedule.next_after(now).ok(),
            })
            .collect()
    }

    /// Synchronize the registry with a freshly fetched definition set.
    ///
    /// New DAGs are added and only fire for occurrences after `now`. DAGs
    /// absent from `dags` are removed. A changed definition replaces the old
    /// one, keeping its fire cursor when the cron expression is the same. A
    /// definition whose cron does not parse is rejected; if an older version
    /// of it is registered, that version stays.
    pub fn reconcile(&mut self, dags: Vec<DagDefinition>, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<DagId> = HashSet::new();

        for dag in dags {
            if !seen.insert(dag.id.clone()) {
                warn!(dag = %dag.id, "Duplicate dag id in definition set, ignoring later entry");
                report
                    .rejected
                    .push((dag.id.clone(), "duplicate dag id".to_string()));
                continue;
            }

            if self.triggers.get(&dag.id).is_some_and(|t| *t.dag == dag) {
                report.unchanged.push(dag.id);
                continue;
            }

            let schedule = match Schedule::new(&dag.cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(dag = %dag.id, cron = %dag.cron, error = %e, "Rejecting dag with invalid cron");
                    report.rejected.push((dag.id.clone(), e.to_string()));
                    continue;
                }
            };

            match self.triggers.get_mut(&dag.id) {
                Some(existing) => {
                    if existing.schedule != schedule {
                        existing.schedule = schedule;
                        existing.last_checked = now;
                    }
                    debug!(dag = %dag.id, "Updating trigger");
                    report.updated.push(dag.id.clone());
                    existing.dag = Arc::new(dag);
                }
                None => {
                    debug!(dag = %dag.id, cron = %schedule.expression(), "Adding trigger");
                    report.added.push(dag.id.clone());
                    self.triggers.insert(
                        dag.id.clone(),
                        Trigger {
                            dag: Arc::new(dag),
                            schedule,
                            last_checked: now,
                        },
                    );
                }
            }
        }

        let stale: Vec<DagId> = self
            .triggers
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            debug!(dag = %id, "Removing trigger");
            self.triggers.remove(&id);
            report.removed.push(id);
        }

        report
    }

    /// Collect the DAGs with at least one occurrence in `(last check, now]`.
    ///
    /// Each trigger is returned at most once per call however many
    /// occurrences elapsed, and every cursor moves to `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Arc<DagDefinition>> {
        let mut due = Vec::new();

        for trigger in self.triggers.values_mut() {
            if now <= trigger.last_checked {
                continue;
            }
            let occurrences =
                trigger
                    .schedule
                    .occurrences_between(trigger.last_checked, now, MAX_COUNT_ITERATIONS);
            let last_check = trigger.last_checked;
            trigger.last_checked = now;

            if occurrences == 0 {
                continue;
            }
            if occurrences >= MAX_COUNT_ITERATIONS {
                warn!(
                    dag = %trigger.dag.id,
                    last_check = %last_check,
                    now = %now,
                    missed_occurrences = format!("{}+", occurrences),
                    "Many scheduled occurrences missed, firing once"
                );
            } else if occurrences > 1 {
                warn!(
                    dag = %trigger.dag.id,
                    last_check = %last_check,
                    now = %now,
                    missed_occurrences = occurrences,
                    "Multiple scheduled occurrences missed, firing once"
                );
            }
            due.push(Arc::clone(&trigger.dag));
        }

        due
    }
}
