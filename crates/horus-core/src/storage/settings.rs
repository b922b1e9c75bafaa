//! Key/value settings and the attendance rule set derived from them.
//!
//! Rule keys share their names with the `[rules]` section of the config
//! file. A key present in the table overrides the configured default; a
//! missing key falls back to it.

use rusqlite::types::Value;

use super::{now_text, RulesConfig, Store};
use crate::attendance::rules::AttendanceRuleSet;
use crate::error::{CoreError, DatabaseError, ValidationError};

pub const WORK_START_TIME: &str = "work_start_time";
pub const WORK_END_TIME: &str = "work_end_time";
pub const LATE_GRACE_PERIOD: &str = "late_grace_period";
pub const EARLY_LEAVE_GRACE_PERIOD: &str = "early_leave_grace_period";
pub const CHECK_IN_WINDOW_START: &str = "check_in_window_start";
pub const CHECK_IN_WINDOW_END: &str = "check_in_window_end";
pub const CHECK_OUT_WINDOW_START: &str = "check_out_window_start";
pub const CHECK_OUT_WINDOW_END: &str = "check_out_window_end";
/// Comma-separated weekday names, or a JSON array of them.
pub const WORKDAYS: &str = "workdays";

/// Read one setting.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn get_setting(store: &Store, key: &str) -> Result<Option<String>, DatabaseError> {
    store
        .select_optional(
            "SELECT value FROM settings WHERE key = ?1",
            &[Value::from(key.to_string())],
            |row| row.get::<_, String>(0),
        )
        .await
}

/// Write one setting.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn set_setting(store: &Store, key: &str, value: &str) -> Result<(), DatabaseError> {
    store
        .execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            &[
                Value::from(key.to_string()),
                Value::from(value.to_string()),
                Value::from(now_text()),
            ],
        )
        .await?;
    Ok(())
}

/// Remove one setting, restoring the configured default.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn delete_setting(store: &Store, key: &str) -> Result<(), DatabaseError> {
    store
        .execute(
            "DELETE FROM settings WHERE key = ?1",
            &[Value::from(key.to_string())],
        )
        .await?;
    Ok(())
}

fn parse_grace(key: &str, value: &str) -> Result<u32, ValidationError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ValidationError::InvalidValue {
            field: key.to_string(),
            message: format!("expected whole minutes, got '{value}'"),
        })
}

fn parse_workdays(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(value) {
            return list;
        }
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load the rule set for a run.
///
/// # Errors
/// Returns an error if the settings cannot be read or a value does not
/// parse.
pub async fn load_rule_set(
    store: &Store,
    defaults: &RulesConfig,
) -> Result<AttendanceRuleSet, CoreError> {
    let stored: Vec<(String, String)> = store
        .select("SELECT key, value FROM settings", &[], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .await?;

    let mut cfg = defaults.clone();
    for (key, value) in stored {
        match key.as_str() {
            WORK_START_TIME => cfg.work_start_time = value,
            WORK_END_TIME => cfg.work_end_time = value,
            LATE_GRACE_PERIOD => cfg.late_grace_period = parse_grace(&key, &value)?,
            EARLY_LEAVE_GRACE_PERIOD => cfg.early_leave_grace_period = parse_grace(&key, &value)?,
            CHECK_IN_WINDOW_START => cfg.check_in_window_start = value,
            CHECK_IN_WINDOW_END => cfg.check_in_window_end = value,
            CHECK_OUT_WINDOW_START => cfg.check_out_window_start = value,
            CHECK_OUT_WINDOW_END => cfg.check_out_window_end = value,
            WORKDAYS => cfg.workdays = parse_workdays(&value),
            _ => {}
        }
    }

    Ok(AttendanceRuleSet::from_config(&cfg)?)
}
