//! Daily attendance summaries, one row per person and date.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Row;
use uuid::Uuid;

use super::punches::{format_timestamp, parse_timestamp};
use super::{now_text, Session, Store};
use crate::attendance::rules::{AttendanceStatus, DailySummaryDraft, SummaryFlag};
use crate::error::{CoreError, DatabaseError, ValidationError};

const UPSERT_SQL: &str = "INSERT INTO attendance_day_summary
        (id, user_id, date, check_in_time, check_out_time, is_incomplete,
         late_minutes, early_minutes, status, flags, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
     ON CONFLICT(user_id, date) DO UPDATE SET
        check_in_time = excluded.check_in_time,
        check_out_time = excluded.check_out_time,
        is_incomplete = excluded.is_incomplete,
        late_minutes = excluded.late_minutes,
        early_minutes = excluded.early_minutes,
        status = excluded.status,
        flags = excluded.flags,
        updated_at = excluded.updated_at";

const SUMMARY_COLUMNS: &str = "user_id, date, check_in_time, check_out_time, is_incomplete, \
     late_minutes, early_minutes, status, flags";

fn upsert_params(draft: &DailySummaryDraft) -> Result<Vec<Value>, CoreError> {
    Ok(vec![
        Value::from(Uuid::new_v4().to_string()),
        Value::from(draft.person_id.clone()),
        Value::from(draft.date.format("%Y-%m-%d").to_string()),
        Value::from(draft.check_in.as_ref().map(format_timestamp)),
        Value::from(draft.check_out.as_ref().map(format_timestamp)),
        Value::from(draft.incomplete),
        Value::from(i64::from(draft.late_minutes)),
        Value::from(i64::from(draft.early_minutes)),
        Value::from(draft.status.as_str().to_string()),
        Value::from(serde_json::to_string(&draft.flags)?),
        Value::from(now_text()),
    ])
}

fn conversion_error(col: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, message.into())
}

fn row_to_draft(row: &Row<'_>) -> rusqlite::Result<DailySummaryDraft> {
    let date: String = row.get(1)?;
    let status: String = row.get(7)?;
    let flags: Option<String> = row.get(8)?;
    Ok(DailySummaryDraft {
        person_id: row.get(0)?,
        date: date
            .parse::<NaiveDate>()
            .map_err(|e| conversion_error(1, e.to_string()))?,
        check_in: row.get::<_, Option<String>>(2)?.as_deref().and_then(parse_timestamp),
        check_out: row.get::<_, Option<String>>(3)?.as_deref().and_then(parse_timestamp),
        incomplete: row.get(4)?,
        late_minutes: row.get(5)?,
        early_minutes: row.get(6)?,
        status: AttendanceStatus::parse(&status)
            .ok_or_else(|| conversion_error(7, format!("unknown status '{status}'")))?,
        flags: match flags.as_deref() {
            None | Some("") => Vec::new(),
            Some(json) => serde_json::from_str::<Vec<SummaryFlag>>(json)
                .map_err(|e| conversion_error(8, e.to_string()))?,
        },
    })
}

/// Upsert a draft inside an open session (for savepoint-scoped rebuilds).
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn upsert_summary_in(
    session: &mut Session<'_>,
    draft: &DailySummaryDraft,
) -> Result<(), CoreError> {
    session.execute(UPSERT_SQL, &upsert_params(draft)?).await?;
    Ok(())
}

/// Insert or replace the summary for `(draft.person_id, draft.date)`.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn upsert_summary(store: &Store, draft: &DailySummaryDraft) -> Result<(), CoreError> {
    store.execute(UPSERT_SQL, &upsert_params(draft)?).await?;
    Ok(())
}

/// # Errors
/// Returns an error if the query fails.
pub async fn get_summary(
    store: &Store,
    user_id: &str,
    date: NaiveDate,
) -> Result<Option<DailySummaryDraft>, DatabaseError> {
    store
        .select_optional(
            &format!(
                "SELECT {SUMMARY_COLUMNS} FROM attendance_day_summary WHERE user_id = ?1 AND date = ?2"
            ),
            &[
                Value::from(user_id.to_string()),
                Value::from(date.format("%Y-%m-%d").to_string()),
            ],
            row_to_draft,
        )
        .await
}

/// Summaries with `from <= date <= to`, ordered by date then person.
///
/// # Errors
/// Returns a validation error for an inverted range, or a database error.
pub async fn list_summaries(
    store: &Store,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailySummaryDraft>, CoreError> {
    if from > to {
        return Err(ValidationError::InvalidDateRange { start: from, end: to }.into());
    }
    Ok(store
        .select(
            &format!(
                "SELECT {SUMMARY_COLUMNS} FROM attendance_day_summary
                 WHERE date >= ?1 AND date <= ?2 ORDER BY date, user_id"
            ),
            &[
                Value::from(from.format("%Y-%m-%d").to_string()),
                Value::from(to.format("%Y-%m-%d").to_string()),
            ],
            row_to_draft,
        )
        .await?)
}
