//! `sluice.toml` configuration.
//!
//! ```toml
//! [database]
//! url = "sqlite://sluice.db"
//!
//! [storage]
//! type = "file"
//! directory = "/var/lib/sluice"
//!
//! [executor]
//! poll_interval_ms = 500
//!
//! [process]
//! program = "python3"
//! args = ["-m", "sluice_worker"]
//!
//! [airflow.3f1c2a0e-6d5b-4c59-9a57-2c1d1f0e8b11]
//! host = "http://airflow:8080"
//! username = "admin"
//! password = "${AIRFLOW_PASSWORD}"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use engine::{reconcile::AirflowCredentials, ExecutorConfig};
use serde::Deserialize;
use storage::StorageConfig;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Storage for DAGs registered without their own storage config.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub process: ProcessConfig,
    /// Airflow credentials keyed by integration id.
    #[serde(default)]
    pub airflow: HashMap<Uuid, AirflowCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url(), max_connections: default_max_connections() }
    }
}

fn default_database_url() -> String {
    "sqlite://sluice.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_launch_concurrency")]
    pub launch_concurrency: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            launch_concurrency: default_launch_concurrency(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    ExecutorConfig::default().poll_interval.as_millis() as u64
}

fn default_launch_concurrency() -> usize {
    ExecutorConfig::default().launch_concurrency
}

impl ExecutorSection {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            launch_concurrency: self.launch_concurrency.max(1),
        }
    }
}

/// The local program that executes one job spec.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { program: default_program(), args: Vec::new() }
    }
}

fn default_program() -> String {
    "sluice-worker".to_string()
}

impl Config {
    /// Load `path`, expanding `${VAR}` references from the environment.
    /// Without a path the defaults apply.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&expand_env_vars(&content))
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Replace `${NAME}` with the value of environment variable `NAME` (empty
/// when unset).
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.database.url, "sqlite://sluice.db");
        assert_eq!(config.database.max_connections, 5);
        assert!(config.storage.is_none());
        assert!(config.airflow.is_empty());

        let executor = config.executor.to_executor_config();
        assert_eq!(executor.poll_interval, ExecutorConfig::default().poll_interval);
        assert_eq!(executor.launch_concurrency, 3);
    }

    #[test]
    fn full_config_parses() {
        let id = Uuid::new_v4();
        let config = Config::parse(&format!(
            r#"
            [database]
            url = "sqlite:///tmp/sluice.db"

            [storage]
            type = "file"
            directory = "/tmp/blobs"

            [executor]
            poll_interval_ms = 250
            launch_concurrency = 0

            [process]
            program = "python3"
            args = ["-m", "worker"]

            [airflow.{id}]
            host = "http://airflow:8080"
            username = "admin"
            password = "secret"
            "#
        ))
        .unwrap();

        assert_eq!(config.storage, Some(StorageConfig::File { directory: "/tmp/blobs".into() }));
        assert_eq!(config.process.args, vec!["-m", "worker"]);
        assert_eq!(config.airflow[&id].host, "http://airflow:8080");

        let executor = config.executor.to_executor_config();
        assert_eq!(executor.poll_interval, Duration::from_millis(250));
        assert_eq!(executor.launch_concurrency, 1);
    }

    #[test]
    fn env_vars_are_expanded() {
        std::env::set_var("SLUICE_TEST_PASSWORD", "hunter2");
        assert_eq!(
            expand_env_vars("password = \"${SLUICE_TEST_PASSWORD}\" # ${"),
            "password = \"hunter2\" # ${"
        );
        assert_eq!(expand_env_vars("${SLUICE_TEST_UNSET_VAR}x"), "x");
    }
}
