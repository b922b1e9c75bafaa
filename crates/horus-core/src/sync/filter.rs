//! Client-side narrowing of fetched logs, applied before any database work.

use chrono::{Duration, NaiveDateTime};

use super::types::SyncMode;
use crate::device::DeviceLog;
use crate::error::ValidationError;

/// Reject an inverted range before the device is contacted.
///
/// # Errors
/// Returns [`ValidationError::InvalidDateRange`] when `start > end`.
pub fn validate_mode(mode: &SyncMode) -> Result<(), ValidationError> {
    match *mode {
        SyncMode::Range { start, end } if start > end => {
            Err(ValidationError::InvalidDateRange { start, end })
        }
        _ => Ok(()),
    }
}

/// Keep the logs the requested mode asks for.
///
/// `Latest` keeps timestamps at or after `latest_stored - overlap_days`, or
/// everything when the device has nothing stored yet or the window reaches
/// past the earliest representable time.
pub fn apply_window(
    logs: Vec<DeviceLog>,
    mode: &SyncMode,
    latest_stored: Option<NaiveDateTime>,
    overlap_days: u32,
) -> Vec<DeviceLog> {
    match *mode {
        SyncMode::All => logs,
        SyncMode::Latest => match latest_stored {
            None => logs,
            Some(latest) => {
                match latest.checked_sub_signed(Duration::days(i64::from(overlap_days))) {
                    Some(from) => logs.into_iter().filter(|l| l.timestamp >= from).collect(),
                    None => logs,
                }
            }
        },
        SyncMode::Range { start, end } => logs
            .into_iter()
            .filter(|l| {
                let date = l.timestamp.date();
                start <= date && date <= end
            })
            .collect(),
    }
}

/// Drop logs at or before `latest_stored - slack_minutes`; they are
/// assumed to be stored already. Returns the survivors and the number
/// dropped. A slack reaching past the earliest representable time drops
/// nothing.
pub fn prefilter_stored(
    logs: Vec<DeviceLog>,
    latest_stored: Option<NaiveDateTime>,
    slack_minutes: u32,
) -> (Vec<DeviceLog>, usize) {
    let Some(latest) = latest_stored else {
        return (logs, 0);
    };
    let Some(threshold) = latest.checked_sub_signed(Duration::minutes(i64::from(slack_minutes)))
    else {
        return (logs, 0);
    };
    let before = logs.len();
    let kept: Vec<DeviceLog> = logs.into_iter().filter(|l| l.timestamp > threshold).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
