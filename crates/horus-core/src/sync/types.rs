//! Core types for device synchronization.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which part of the device history a run keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Everything the device returns.
    #[default]
    All,
    /// Records from the latest stored punch minus the overlap window on.
    Latest,
    /// Records whose date falls in `start..=end`.
    Range { start: NaiveDate, end: NaiveDate },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub mode: SyncMode,
}

impl SyncOptions {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }
}

/// Stage of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    /// Building the connection settings from the device record and
    /// checking them before any call goes out.
    Connecting,
    Fetching,
    ReconcilingUsers,
    IngestingLogs,
    RebuildingSummaries,
    Complete,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Connecting => "connecting",
            SyncPhase::Fetching => "fetching",
            SyncPhase::ReconcilingUsers => "reconciling_users",
            SyncPhase::IngestingLogs => "ingesting_logs",
            SyncPhase::RebuildingSummaries => "rebuilding_summaries",
            SyncPhase::Complete => "complete",
            SyncPhase::Failed => "failed",
            SyncPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Complete | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub device_id: String,
    pub phase: SyncPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Report of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub device_id: String,
    pub outcome: SyncOutcome,
    /// Completed with no recorded errors.
    pub success: bool,
    pub users_added: usize,
    pub users_synced: usize,
    pub logs_fetched: usize,
    pub logs_added: usize,
    pub logs_duplicate: usize,
    /// Dropped before insert as already stored.
    pub logs_prefiltered: usize,
    /// Punches on rebuilt dates that matched no profile.
    pub logs_unmatched: usize,
    pub summaries_updated: usize,
    pub dates_touched: Vec<NaiveDate>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub(crate) fn new(device_id: &str) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.to_string(),
            outcome: SyncOutcome::Completed,
            success: false,
            users_added: 0,
            users_synced: 0,
            logs_fetched: 0,
            logs_added: 0,
            logs_duplicate: 0,
            logs_prefiltered: 0,
            logs_unmatched: 0,
            summaries_updated: 0,
            dates_touched: Vec::new(),
            errors: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Stamp the finish time and derive `success`.
    pub(crate) fn finish(mut self, outcome: SyncOutcome) -> Self {
        self.outcome = outcome;
        self.success = outcome == SyncOutcome::Completed && self.errors.is_empty();
        self.finished_at = Utc::now();
        self
    }
}
