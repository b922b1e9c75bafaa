//! Stored punches (the `attendance_logs_raw` table).
//!
//! Timestamps are device-local wall-clock times stored as
//! `YYYY-MM-DDTHH:MM:SS`, so text order is time order and a punch's date is
//! the first ten characters.

use chrono::{Days, NaiveDate, NaiveDateTime};
use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::{CoreError, DatabaseError, ValidationError};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Exclusive upper bound for timestamps on `date`.
fn day_after_text(date: NaiveDate) -> String {
    date.checked_add_days(Days::new(1))
        .map(date_text)
        .unwrap_or_else(|| "9999-12-32".to_string())
}

/// One stored punch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchRecord {
    pub id: String,
    pub device_id: String,
    pub device_user_id: String,
    pub timestamp: NaiveDateTime,
    pub verify_type: Option<i64>,
    pub punch_type: Option<i64>,
    pub raw_payload: Option<String>,
}

impl PunchRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

const PUNCH_COLUMNS: &str =
    "id, device_id, device_user_id, timestamp, verify_type, punch_type, raw_payload";

fn row_to_punch(row: &Row<'_>) -> rusqlite::Result<PunchRecord> {
    let ts: String = row.get(3)?;
    let timestamp = parse_timestamp(&ts).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("bad timestamp '{ts}'").into(),
        )
    })?;
    Ok(PunchRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        device_user_id: row.get(2)?,
        timestamp,
        verify_type: row.get(4)?,
        punch_type: row.get(5)?,
        raw_payload: row.get(6)?,
    })
}

/// Most recent stored timestamp for a device.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn latest_timestamp(
    store: &Store,
    device_id: &str,
) -> Result<Option<NaiveDateTime>, DatabaseError> {
    let latest = store
        .select_optional(
            "SELECT MAX(timestamp) FROM attendance_logs_raw WHERE device_id = ?1",
            &[Value::from(device_id.to_string())],
            |row| row.get::<_, Option<String>>(0),
        )
        .await?
        .flatten();
    Ok(latest.as_deref().and_then(parse_timestamp))
}

/// Every punch on one calendar date, all devices, in time order.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn punches_on(store: &Store, date: NaiveDate) -> Result<Vec<PunchRecord>, DatabaseError> {
    store
        .select(
            &format!(
                "SELECT {PUNCH_COLUMNS} FROM attendance_logs_raw
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp, id"
            ),
            &[Value::from(date_text(date)), Value::from(day_after_text(date))],
            row_to_punch,
        )
        .await
}

/// Number of stored punches, optionally for one device.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn count_punches(store: &Store, device_id: Option<&str>) -> Result<u64, DatabaseError> {
    let count = store
        .select_optional(
            "SELECT COUNT(*) FROM attendance_logs_raw WHERE ?1 IS NULL OR device_id = ?1",
            &[Value::from(device_id.map(str::to_string))],
            |row| row.get::<_, i64>(0),
        )
        .await?
        .unwrap_or(0);
    Ok(u64::try_from(count).unwrap_or(0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchSort {
    #[default]
    Timestamp,
    DeviceUserId,
    DeviceId,
}

impl PunchSort {
    fn column(&self) -> &'static str {
        match self {
            PunchSort::Timestamp => "timestamp",
            PunchSort::DeviceUserId => "device_user_id",
            PunchSort::DeviceId => "device_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp" => Some(PunchSort::Timestamp),
            "device_user_id" | "user" => Some(PunchSort::DeviceUserId),
            "device_id" | "device" => Some(PunchSort::DeviceId),
            _ => None,
        }
    }
}

/// Filter, order and page for [`query_punches`]. Date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub device_id: Option<String>,
    pub device_user_id: Option<String>,
    pub sort: PunchSort,
    pub descending: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Query stored punches. Ties in the sort column are broken by id
/// ascending.
///
/// # Errors
/// Returns a validation error when `date_from > date_to`, or a database
/// error if the query fails.
pub async fn query_punches(store: &Store, query: &PunchQuery) -> Result<Vec<PunchRecord>, CoreError> {
    if let (Some(start), Some(end)) = (query.date_from, query.date_to) {
        if start > end {
            return Err(ValidationError::InvalidDateRange { start, end }.into());
        }
    }

    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if let Some(from) = query.date_from {
        params.push(Value::from(date_text(from)));
        clauses.push(format!("timestamp >= ?{}", params.len()));
    }
    if let Some(to) = query.date_to {
        params.push(Value::from(day_after_text(to)));
        clauses.push(format!("timestamp < ?{}", params.len()));
    }
    if let Some(device_id) = &query.device_id {
        params.push(Value::from(device_id.clone()));
        clauses.push(format!("device_id = ?{}", params.len()));
    }
    if let Some(user) = &query.device_user_id {
        params.push(Value::from(user.clone()));
        clauses.push(format!("device_user_id = ?{}", params.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let direction = if query.descending { "DESC" } else { "ASC" };
    let limit = query.limit.map(i64::from).unwrap_or(-1);

    let sql = format!(
        "SELECT {PUNCH_COLUMNS} FROM attendance_logs_raw {where_clause}
         ORDER BY {} {direction}, id ASC
         LIMIT {limit} OFFSET {}",
        query.sort.column(),
        query.offset
    );

    Ok(store.select(&sql, &params, row_to_punch).await?)
}
