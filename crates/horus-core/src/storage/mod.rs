mod config;
pub mod devices;
pub mod directory;
pub mod holidays;
pub mod migrations;
pub mod punches;
pub mod settings;
pub mod store;
pub mod summaries;

pub use config::{
    Config, DeviceSettings, IngestConfig, RetryConfig, RulesConfig, StorageConfig, SyncConfig,
};
pub use store::{Session, Store};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/horus-attendance[-dev]/` based on HORUS_ENV.
///
/// Set HORUS_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("HORUS_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("horus-attendance-dev")
    } else {
        base_dir.join("horus-attendance")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::DataDir(e.to_string()))?;
    Ok(dir)
}

/// Current wall-clock time in the format used by `created_at`/`updated_at`.
pub(crate) fn now_text() -> String {
    chrono::Utc::now().to_rfc3339()
}
