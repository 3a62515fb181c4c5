//! Cron schedule parsing and next occurrence calculation.
//!
//! Expressions use six fields with seconds resolution
//! (`second minute hour day-of-month month day-of-week`) and are always
//! evaluated in UTC.

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A parsed six-field cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    inner: Box<CronSchedule>,
}

impl Schedule {
    /// Parse a six-field cron expression.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let trimmed = expression.trim();

        let fields = trimmed.split_whitespace().count();
        if fields != 6 {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 6 fields, got {}: '{}'",
                fields, trimmed
            )));
        }

        let inner = CronSchedule::from_str(trimmed)
            .map_err(|e| ScheduleError::InvalidCron(format!("'{}': {}", trimmed, e)))?;

        Ok(Self {
            expression: trimmed.to_string(),
            inner: Box::new(inner),
        })
    }

    /// Get the next occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.inner
            .after(&after)
            .next()
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Get the next occurrence from now.
    pub fn next(&self) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after(Utc::now())
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.inner.after(&after).take(n).collect()
    }

    /// Count occurrences in the half-open window `(from, to]`, stopping at `limit`.
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> usize {
        self.inner
            .after(&from)
            .take_while(|t| *t <= to)
            .take(limit)
            .count()
    }

    /// The expression string as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Schedule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let expression = String::deserialize(deserializer)?;
        Schedule::new(expression).map_err(serde::de::Error::custom)
    }
}
