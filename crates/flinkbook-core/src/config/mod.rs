use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;

use crate::error::{Error, Result};

const APP_DIR: &str = "flinkbook";
const CONFIG_FILE: &str = "config.toml";

/// Top-level settings, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl Settings {
    /// Get the path to the default settings file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load settings from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load settings from `path`, or return defaults if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        match toml::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse settings file at {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize settings: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize settings: {e}")))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// Launch settings for the local Flink MiniCluster runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Java executable. Falls back to `$JAVA_HOME/bin/java`, then `java` on the PATH.
    pub java: Option<PathBuf>,
    /// The MiniCluster runner jar.
    pub artifact: PathBuf,
    /// Directory holding `flink-conf.yaml`, exported as `FLINK_CONF_DIR`.
    pub config_dir: PathBuf,
    pub memory_mb: u32,
    pub parallelism: u32,
    pub task_slots: u32,
    pub gateway_port: u16,
    pub rest_port: u16,
    pub jvm_options: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub readiness_timeout_ms: u64,
    pub readiness_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub kill_timeout_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            java: None,
            artifact: data_dir.join("flink-minicluster.jar"),
            config_dir: data_dir.join("conf"),
            memory_mb: 2048,
            parallelism: 2,
            task_slots: 2,
            gateway_port: 8083,
            rest_port: 8081,
            jvm_options: Vec::new(),
            env: BTreeMap::new(),
            readiness_timeout_ms: 30_000,
            readiness_interval_ms: 1_000,
            stop_grace_ms: 10_000,
            kill_timeout_ms: 5_000,
        }
    }
}

impl RuntimeSettings {
    pub fn gateway_url(&self) -> String {
        format!("http://localhost:{}", self.gateway_port)
    }

    pub fn readiness_url(&self) -> String {
        format!("{}/v1/info", self.gateway_url())
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Streaming,
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SessionSettings {
    pub name: Option<String>,
    pub execution_mode: ExecutionMode,
    /// Extra session properties. These override the defaults.
    pub properties: BTreeMap<String, String>,
}

/// Polling cadence and budgets for statement execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    pub status_poll_interval_ms: u64,
    pub status_max_attempts: u32,
    /// Delay between status convergence and the first result fetch.
    pub settle_delay_ms: u64,
    pub fetch_retry_interval_ms: u64,
    pub fetch_max_attempts: u32,
    pub stream_poll_interval_ms: u64,
    pub transient_retry_ms: u64,
    pub progress_every_rows: usize,
    /// Ask before consuming more than this many streaming rows. `None` disables the check.
    pub row_limit: Option<usize>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 1_000,
            status_max_attempts: 60,
            settle_delay_ms: 1_000,
            fetch_retry_interval_ms: 500,
            fetch_max_attempts: 60,
            stream_poll_interval_ms: 500,
            transient_retry_ms: 2_000,
            progress_every_rows: 10,
            row_limit: Some(10_000),
        }
    }
}

impl ExecutionSettings {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn fetch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_interval_ms)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_ms)
    }

    pub fn transient_retry(&self) -> Duration {
        Duration::from_millis(self.transient_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[runtime]
gateway_port = 9093
parallelism = 4

[session]
execution_mode = "batch"

[session.properties]
"table.exec.state.ttl" = "1 h"

[execution]
row_limit = 250
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.runtime.gateway_port, 9093);
        assert_eq!(settings.runtime.parallelism, 4);
        assert_eq!(settings.runtime.task_slots, 2);
        assert_eq!(settings.session.execution_mode, ExecutionMode::Batch);
        assert_eq!(
            settings.session.properties.get("table.exec.state.ttl"),
            Some(&"1 h".to_string())
        );
        assert_eq!(settings.execution.row_limit, Some(250));
        assert_eq!(settings.execution.fetch_max_attempts, 60);
        assert_eq!(
            settings.runtime.readiness_url(),
            "http://localhost:9093/v1/info"
        );
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "runtime = [not valid").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut settings = Settings::default();
        settings.runtime.memory_mb = 4096;
        settings.execution.row_limit = Some(5);
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.runtime.memory_mb, 4096);
        assert_eq!(loaded.execution.row_limit, Some(5));
    }
}
