//! Configuration management for the quest runtime.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3030`.
//! - `QUEST_CLI_PATH` - Optional. Assistant CLI executable. Defaults to `claude`.
//! - `QUEST_DATA_DIR` - Optional. Snapshot directory. Defaults to `$HOME/.quest-runtime`.
//! - `QUEST_SERVICE_LOG_LINES` - Optional. Buffered output lines per service. Defaults to `200`.
//! - `QUEST_TASK_OUTPUT_CHARS` - Optional. Scheduled task output kept. Defaults to `2000`.
//! - `QUEST_SCHEDULER_ENABLED` - Optional. Arm scheduler timers on boot. Defaults to `true`.

use std::path::PathBuf;
use thiserror::Error;

use crate::util::{env_var_bool, home_dir};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Path or name of the assistant CLI
    pub cli_path: String,

    /// Directory for best-effort state snapshots
    pub data_dir: PathBuf,

    /// Ring buffer length for background service output
    pub service_log_lines: usize,

    /// Characters of output kept on a scheduled task record
    pub task_output_chars: usize,

    /// Whether scheduler timers are armed at startup
    pub scheduler_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            cli_path: "claude".to_string(),
            data_dir: PathBuf::from(home_dir()).join(".quest-runtime"),
            service_log_lines: 200,
            task_output_chars: 2000,
            scheduler_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let port = parse_env("PORT", defaults.port)?;

        let cli_path = std::env::var("QUEST_CLI_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.cli_path);

        let data_dir = std::env::var("QUEST_DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let service_log_lines = parse_env("QUEST_SERVICE_LOG_LINES", defaults.service_log_lines)?;
        let task_output_chars = parse_env("QUEST_TASK_OUTPUT_CHARS", defaults.task_output_chars)?;
        if service_log_lines == 0 {
            return Err(ConfigError::InvalidValue(
                "QUEST_SERVICE_LOG_LINES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            host,
            port,
            cli_path,
            data_dir,
            service_log_lines,
            task_output_chars,
            scheduler_enabled: env_var_bool("QUEST_SCHEDULER_ENABLED", defaults.scheduler_enabled),
        })
    }

    /// Path of the scheduled task snapshot file.
    pub fn tasks_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("scheduled_tasks.json")
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
