//! Core data model: identifiers, definitions, execution records, retry
//! policy and cron schedules.

pub mod definition;
pub mod execution;
pub mod retry;
pub mod schedule;
pub mod types;
