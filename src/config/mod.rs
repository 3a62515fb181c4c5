//! Configuration loading.
//!
//! This module provides YAML-based tunables and environment-sourced store
//! credentials, optionally read from a `.env` file.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{
    DEFAULT_ENV_FILE, ExecutionSettings, LEGACY_STORE_API_KEY_VAR, LEGACY_STORE_ENDPOINT_VAR,
    STORE_API_KEY_VAR, STORE_ENDPOINT_VAR, SchedulerSettings, Settings, StoreSettings,
};
