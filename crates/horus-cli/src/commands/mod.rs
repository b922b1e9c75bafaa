//! Subcommand handlers and the helpers they share.

pub mod config;
pub mod device;
pub mod holiday;
pub mod logs;
pub mod summary;
pub mod sync;

use std::sync::Arc;

use chrono::NaiveDate;
use horus_core::{Config, Store, SyncOrchestrator, SyncRegistry, ZkClient};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) fn open_store(config: &Config) -> Result<Store, Box<dyn std::error::Error>> {
    let path = config.database_path()?;
    tracing::debug!(path = %path.display(), "opening database");
    Ok(Store::open(&path, &config.storage)?)
}

pub(crate) fn orchestrator(config: &Config) -> Result<SyncOrchestrator, Box<dyn std::error::Error>> {
    let store = open_store(config)?;
    Ok(SyncOrchestrator::new(
        store,
        Arc::new(ZkClient::new(&config.device)),
        SyncRegistry::new(),
        config.clone(),
    ))
}

/// Clap value parser for `YYYY-MM-DD`.
pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

/// A token that is cancelled on Ctrl+C.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            trigger.cancel();
        }
    });
    token
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_accepts_iso_dates_only() {
        assert_eq!(parse_date("2024-03-04"), Ok(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()));
        assert!(parse_date("04/03/2024").is_err());
    }
}
