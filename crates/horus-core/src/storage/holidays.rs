//! Holiday calendar.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;
use crate::error::DatabaseError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub id: String,
    pub date: NaiveDate,
    pub name: Option<String>,
}

/// All holidays by date.
///
/// # Errors
/// Returns an error if the query fails. Rows with an unparseable date are
/// skipped with a warning.
pub async fn list_holidays(store: &Store) -> Result<Vec<Holiday>, DatabaseError> {
    let rows = store
        .select(
            "SELECT id, date, name FROM holidays ORDER BY date",
            &[],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, date, name)| match date.parse::<NaiveDate>() {
            Ok(date) => Some(Holiday { id, date, name }),
            Err(e) => {
                tracing::warn!(holiday_id = %id, date = %date, error = %e, "skipping holiday with bad date");
                None
            }
        })
        .collect())
}

/// Add a holiday, replacing the name if the date already exists.
///
/// # Errors
/// Returns an error if the statement fails.
pub async fn add_holiday(
    store: &Store,
    date: NaiveDate,
    name: Option<&str>,
) -> Result<(), DatabaseError> {
    store
        .execute(
            "INSERT INTO holidays (id, date, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(date) DO UPDATE SET name = excluded.name",
            &[
                Value::from(Uuid::new_v4().to_string()),
                Value::from(date.format("%Y-%m-%d").to_string()),
                Value::from(name.map(str::to_string)),
            ],
        )
        .await?;
    Ok(())
}

/// Holiday dates as a set, snapshotted once per sync run.
///
/// # Errors
/// Returns an error if the query fails.
pub async fn holiday_set(store: &Store) -> Result<BTreeSet<NaiveDate>, DatabaseError> {
    Ok(list_holidays(store)
        .await?
        .into_iter()
        .map(|h| h.date)
        .collect())
}
