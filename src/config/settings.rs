//! Process settings.
//!
//! Tunables come from an optional YAML file where every field has a default.
//! The store endpoint and its credential come from the environment, or from
//! a `.env` file when the process environment lacks them, and are required.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::retry::Backoff;
use crate::execution::HttpInvokerOptions;
use crate::scheduler::OverlapPolicy;
use crate::storage::DataApiOptions;

/// Environment variable holding the data API base URL.
pub const STORE_ENDPOINT_VAR: &str = "CADENCE_STORE_ENDPOINT";

/// Environment variable holding the data API key.
pub const STORE_API_KEY_VAR: &str = "CADENCE_STORE_API_KEY";

/// Older name of [`STORE_ENDPOINT_VAR`], still honoured.
pub const LEGACY_STORE_ENDPOINT_VAR: &str = "MONGO_API_ENDPOINT";

/// Older name of [`STORE_API_KEY_VAR`], still honoured.
pub const LEGACY_STORE_API_KEY_VAR: &str = "MONGO_API_KEY";

/// Dotenv file read by [`Settings::load`], relative to the working directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Data API naming and resilience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub database: String,
    pub dags_collection: String,
    pub dag_executions_collection: String,
    pub task_executions_collection: String,
    /// Per-request timeout for store calls.
    pub request_timeout_secs: Option<u64>,
    /// Retries for failed execution writes.
    pub persistence_backoff: Backoff,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database: "scheduler".to_string(),
            dags_collection: "dags".to_string(),
            dag_executions_collection: "dag_executions".to_string(),
            task_executions_collection: "task_executions".to_string(),
            request_timeout_secs: Some(30),
            persistence_backoff: Backoff::default(),
        }
    }
}

/// Scheduler cadences and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often triggers are evaluated.
    pub tick_interval_ms: u64,
    /// How often definitions are re-fetched.
    pub refresh_interval_ms: u64,
    /// Same-DAG overlap policy.
    pub overlap: OverlapPolicy,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_timeout_secs: u64,
    /// Backoff for failing definition refreshes.
    pub definition_fetch_backoff: Backoff,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            refresh_interval_ms: 1000,
            overlap: OverlapPolicy::Allow,
            shutdown_timeout_secs: 30,
            definition_fetch_backoff: Backoff::new(
                u32::MAX,
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Task execution tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Delay between attempts of a task. Zero retries immediately.
    pub retry_delay_ms: u64,
    /// Timeout for one task call. Unset means no timeout.
    pub invoke_timeout_secs: Option<u64>,
    /// `Content-Type` header sent with task calls.
    pub content_type: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 0,
            invoke_timeout_secs: None,
            content_type: "application/json".to_string(),
        }
    }
}

impl ExecutionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Options for the production task invoker.
    pub fn invoker_options(&self) -> HttpInvokerOptions {
        HttpInvokerOptions {
            content_type: self.content_type.clone(),
            timeout: self.invoke_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    store: StoreSettings,
    scheduler: SchedulerSettings,
    execution: ExecutionSettings,
}

/// Complete process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Data API base URL.
    pub store_endpoint: String,
    /// Data API key. Never printed.
    pub store_api_key: SecretString,
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub execution: ExecutionSettings,
}

impl Settings {
    /// Load settings from the optional YAML file, the process environment
    /// and `./.env` if present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_sources(path, Some(Path::new(DEFAULT_ENV_FILE)), |key| {
            std::env::var(key).ok()
        })
    }

    /// Load settings resolving environment variables through `lookup`.
    pub fn from_lookup<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_sources(path, None, lookup)
    }

    /// Load settings resolving variables through `lookup` first, then
    /// through `env_file`. A missing env file is not an error.
    pub fn from_sources<F>(
        path: Option<&Path>,
        env_file: Option<&Path>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dotenv = match env_file {
            Some(env_file) => read_env_file(env_file)?,
            None => HashMap::new(),
        };
        let resolve = |key: &str| lookup(key).or_else(|| dotenv.get(key).cloned());

        let file = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::parse_file(path, &content)?
            }
            None => FileSettings::default(),
        };

        let store_endpoint = required(&resolve, STORE_ENDPOINT_VAR, LEGACY_STORE_ENDPOINT_VAR)?;
        let store_api_key = SecretString::from(required(
            &resolve,
            STORE_API_KEY_VAR,
            LEGACY_STORE_API_KEY_VAR,
        )?);

        let settings = Self {
            store_endpoint,
            store_api_key,
            store: file.store,
            scheduler: file.scheduler,
            execution: file.execution,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn parse_file(path: &Path, content: &str) -> Result<FileSettings, ConfigError> {
        if content.trim().is_empty() {
            return Ok(FileSettings::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::YamlFileError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.refresh_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.request_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "store.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.invoke_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "execution.invoke_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.content_type.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "execution.content_type must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection options for the data API store.
    pub fn data_api_options(&self) -> DataApiOptions {
        DataApiOptions {
            endpoint: self.store_endpoint.clone(),
            api_key: self.store_api_key.clone(),
            database: self.store.database.clone(),
            dags_collection: self.store.dags_collection.clone(),
            dag_executions_collection: self.store.dag_executions_collection.clone(),
            task_executions_collection: self.store.task_executions_collection.clone(),
            timeout: self.store.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// First non-empty value of `key`, falling back to `legacy`.
fn required<F>(lookup: &F, key: &'static str, legacy: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    [key, legacy]
        .into_iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .ok_or(ConfigError::MissingVar(key))
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let env_error = |source: dotenvy::Error| ConfigError::EnvFileError {
        path: path.to_path_buf(),
        source,
    };
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => return Err(env_error(e)),
    };
    entries.map(|entry| entry.map_err(env_error)).collect()
}
