//! TOML-based application configuration.
//!
//! Stores operator preferences including:
//! - Database location and lock-contention retry tuning
//! - Batch sizes for punch ingestion
//! - Sync heuristics (latest-mode overlap, duplicate pre-filter)
//! - Device timeouts and retry policy
//! - Default attendance rules (overridden per key by the `settings` table)
//!
//! Configuration is stored at `~/.config/horus-attendance/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::ConfigError;

/// Lock-contention retry policy for the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound of the random jitter added to each backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// File name (relative to the data dir) or absolute path of the database.
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Batch sizing for the punch insert engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    #[serde(default = "default_rows_per_statement")]
    pub rows_per_statement: usize,
    #[serde(default = "default_statements_per_savepoint")]
    pub statements_per_savepoint: usize,
}

/// Sync orchestration tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Safety overlap for `latest` mode, catching late device writes.
    #[serde(default = "default_latest_overlap_days")]
    pub latest_overlap_days: u32,
    /// Drop records at or before the latest stored timestamp before insert.
    #[serde(default = "default_true")]
    pub prefilter_stored: bool,
    /// Moves the pre-filter threshold back by this many minutes.
    #[serde(default)]
    pub prefilter_slack_minutes: u32,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_cancel_check_every")]
    pub cancel_check_every: usize,
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
}

/// Device communication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts for a combined fetch after a transient failure.
    #[serde(default = "default_sync_retries")]
    pub sync_retries: u32,
    /// Delay step between attempts (attempt n waits n * this).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

/// Default attendance rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RulesConfig {
    #[serde(default = "default_work_start")]
    pub work_start_time: String,
    #[serde(default = "default_work_end")]
    pub work_end_time: String,
    #[serde(default = "default_grace")]
    pub late_grace_period: u32,
    #[serde(default = "default_grace")]
    pub early_leave_grace_period: u32,
    #[serde(default = "default_check_in_window_start")]
    pub check_in_window_start: String,
    #[serde(default = "default_check_in_window_end")]
    pub check_in_window_end: String,
    #[serde(default = "default_check_out_window_start")]
    pub check_out_window_start: String,
    #[serde(default = "default_check_out_window_end")]
    pub check_out_window_end: String,
    /// Weekday abbreviations ("Mon", "Tue", ...).
    #[serde(default = "default_workdays")]
    pub workdays: Vec<String>,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/horus-attendance/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub rules: RulesConfig,
}

// Default functions
fn default_max_attempts() -> u32 {
    6
}
fn default_base_backoff_ms() -> u64 {
    25
}
fn default_max_backoff_ms() -> u64 {
    2_000
}
fn default_jitter_ms() -> u64 {
    25
}
fn default_database_file() -> String {
    "horus_attendance.db".into()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_rows_per_statement() -> usize {
    100
}
fn default_statements_per_savepoint() -> usize {
    5
}
fn default_latest_overlap_days() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_progress_every() -> usize {
    10
}
fn default_cancel_check_every() -> usize {
    10
}
fn default_progress_channel_capacity() -> usize {
    64
}
fn default_device_timeout_ms() -> u64 {
    10_000
}
fn default_sync_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    2
}
fn default_work_start() -> String {
    "09:00".into()
}
fn default_work_end() -> String {
    "17:00".into()
}
fn default_grace() -> u32 {
    15
}
fn default_check_in_window_start() -> String {
    "06:00".into()
}
fn default_check_in_window_end() -> String {
    "12:00".into()
}
fn default_check_out_window_start() -> String {
    "12:00".into()
}
fn default_check_out_window_end() -> String {
    "23:59".into()
}
fn default_workdays() -> Vec<String> {
    ["Mon", "Tue", "Wed", "Thu", "Fri"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rows_per_statement: default_rows_per_statement(),
            statements_per_savepoint: default_statements_per_savepoint(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            latest_overlap_days: default_latest_overlap_days(),
            prefilter_stored: true,
            prefilter_slack_minutes: 0,
            progress_every: default_progress_every(),
            cancel_check_every: default_cancel_check_every(),
            progress_channel_capacity: default_progress_channel_capacity(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_device_timeout_ms(),
            sync_retries: default_sync_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            work_start_time: default_work_start(),
            work_end_time: default_work_end(),
            late_grace_period: default_grace(),
            early_leave_grace_period: default_grace(),
            check_in_window_start: default_check_in_window_start(),
            check_in_window_end: default_check_in_window_end(),
            check_out_window_start: default_check_out_window_start(),
            check_out_window_end: default_check_out_window_end(),
            workdays: default_workdays(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default config file location.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from an explicit path, writing defaults when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the defaults cannot
    /// be written.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(_) => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
        }
    }

    /// Persist to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// Persist to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without persisting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        *self = serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Resolved database path: absolute paths are used as-is, anything else
    /// lives in the data directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        let file = Path::new(&self.storage.database_file);
        if file.is_absolute() {
            Ok(file.to_path_buf())
        } else {
            Ok(data_dir()?.join(file))
        }
    }

    /// Load from disk, returning default on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: Config = toml::from_str("[sync]\nlatest_overlap_days = 5\n").unwrap();
        assert_eq!(parsed.sync.latest_overlap_days, 5);
        assert!(parsed.sync.prefilter_stored);
        assert_eq!(parsed.ingest.rows_per_statement, 100);
        assert_eq!(parsed.rules.work_start_time, "09:00");
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.get("sync.latest_overlap_days").as_deref(), Some("2"));
        assert_eq!(cfg.get("storage.retry.max_attempts").as_deref(), Some("6"));
        assert_eq!(cfg.get("rules.work_end_time").as_deref(), Some("17:00"));
        assert!(cfg.get("sync.missing_key").is_none());
    }

    #[test]
    fn set_updates_nested_values() {
        let mut cfg = Config::default();
        cfg.set("sync.prefilter_stored", "false").unwrap();
        cfg.set("ingest.rows_per_statement", "50").unwrap();
        cfg.set("rules.work_start_time", "08:30").unwrap();
        cfg.set("rules.workdays", r#"["Sun","Mon"]"#).unwrap();
        assert!(!cfg.sync.prefilter_stored);
        assert_eq!(cfg.ingest.rows_per_statement, 50);
        assert_eq!(cfg.rules.work_start_time, "08:30");
        assert_eq!(cfg.rules.workdays, vec!["Sun", "Mon"]);
    }

    #[test]
    fn set_rejects_unknown_key() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set("sync.nonexistent", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn set_rejects_invalid_type() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set("sync.prefilter_stored", "sometimes"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(cfg.set("sync.progress_every", "-3").is_err());
    }

    #[test]
    fn load_from_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(path.exists());

        let mut changed = cfg.clone();
        changed.device.timeout_ms = 2_500;
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().device.timeout_ms, 2_500);
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let mut cfg = Config::default();
        let abs = std::env::temp_dir().join("horus-test.db");
        cfg.storage.database_file = abs.display().to_string();
        assert_eq!(cfg.database_path().unwrap(), abs);
    }
}
