//! Deduplicating batch insert of raw punches.
//!
//! Records are written with multi-row `INSERT OR IGNORE` statements against
//! the natural key `(device_id, device_user_id, timestamp)`, so re-ingesting
//! the same data is a no-op that only moves the `duplicates` counter.
//! Statements are grouped under savepoints; a failing group is rolled back
//! and skipped while the rest of the run carries on.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CoreError, DatabaseError};
use crate::storage::punches::format_timestamp;
use crate::storage::{IngestConfig, Session, Store};

const PARAMS_PER_ROW: usize = 7;
/// SQLite's default bound-parameter limit.
const MAX_PARAMS: usize = 999;

/// A punch ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPunchRecord {
    pub device_id: String,
    pub device_user_id: String,
    pub timestamp: NaiveDateTime,
    pub verify_type: u8,
    pub punch_type: u8,
    /// The record as received from the device, JSON encoded.
    pub raw_payload: Option<String>,
}

impl RawPunchRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Progress after each committed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub processed: usize,
    pub total: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_batches: usize,
    /// Dates of rows that were actually inserted.
    pub inserted_dates: BTreeSet<NaiveDate>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// Writes punches in savepoint-scoped groups.
#[derive(Debug, Clone)]
pub struct BatchInserter {
    store: Store,
    rows_per_statement: usize,
    statements_per_savepoint: usize,
}

fn insert_sql(rows: usize) -> String {
    let mut sql = String::from(
        "INSERT OR IGNORE INTO attendance_logs_raw \
         (id, device_id, device_user_id, timestamp, verify_type, punch_type, raw_payload) VALUES ",
    );
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        let base = row * PARAMS_PER_ROW;
        sql.push('(');
        for col in 1..=PARAMS_PER_ROW {
            if col > 1 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", base + col));
        }
        sql.push(')');
    }
    sql
}

/// Append one row's parameters and return its generated id.
fn row_params(record: &RawPunchRecord, out: &mut Vec<Value>) -> String {
    let id = Uuid::new_v4().to_string();
    out.push(Value::from(id.clone()));
    out.push(Value::from(record.device_id.clone()));
    out.push(Value::from(record.device_user_id.clone()));
    out.push(Value::from(format_timestamp(&record.timestamp)));
    out.push(Value::from(i64::from(record.verify_type)));
    out.push(Value::from(i64::from(record.punch_type)));
    out.push(Value::from(record.raw_payload.clone()));
    id
}

/// Counts from one committed group.
#[derive(Default)]
struct GroupCounts {
    /// Records covered by the statements that ran.
    processed: usize,
    inserted: usize,
    duplicates: usize,
    dates: BTreeSet<NaiveDate>,
    /// Cancelled between statements; the statements that ran are committed.
    cancelled: bool,
}

impl BatchInserter {
    pub fn new(store: Store, config: &IngestConfig) -> Self {
        let max_rows = MAX_PARAMS / PARAMS_PER_ROW;
        Self {
            store,
            rows_per_statement: config.rows_per_statement.clamp(1, max_rows),
            statements_per_savepoint: config.statements_per_savepoint.max(1),
        }
    }

    /// Insert `records`, skipping ones already stored.
    ///
    /// `progress` is awaited after each group, with the connection
    /// released. Cancellation is checked before every statement; a group
    /// cancelled part way commits the statements it already ran, and work
    /// already committed stays.
    ///
    /// # Errors
    /// Failed groups are reported in the outcome, not as an error. An error
    /// is only returned if the store cannot be used at all.
    pub async fn insert_punches<F, Fut>(
        &self,
        records: &[RawPunchRecord],
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<InsertOutcome, CoreError>
    where
        F: FnMut(ChunkProgress) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut outcome = InsertOutcome::default();
        let group_len = self.rows_per_statement * self.statements_per_savepoint;
        let mut processed = 0;

        for (n, group) in records.chunks(group_len).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(processed, total = records.len(), "ingest cancelled");
                outcome.cancelled = true;
                break;
            }

            let savepoint = format!("ingest_{n}");
            let mut session = self.store.session().await;
            let mut stop = false;
            let mut done = group.len();
            match self.insert_group(&mut session, &savepoint, group, cancel).await {
                Ok(counts) => {
                    if counts.cancelled {
                        tracing::info!(batch = n, committed = counts.processed, "ingest cancelled inside group");
                        stop = true;
                        done = counts.processed;
                    }
                    outcome.inserted += counts.inserted;
                    outcome.duplicates += counts.duplicates;
                    outcome.inserted_dates.extend(counts.dates);
                    tracing::debug!(
                        batch = n,
                        inserted = counts.inserted,
                        duplicates = counts.duplicates,
                        "ingest group committed"
                    );
                }
                Err(DatabaseError::InvalidSavepoint(name)) => {
                    return Err(DatabaseError::InvalidSavepoint(name).into());
                }
                Err(e) => {
                    session.abandon(&savepoint).await;
                    tracing::warn!(batch = n, rows = group.len(), error = %e, "ingest group rolled back");
                    outcome.failed_batches += 1;
                    outcome.errors.push(format!("batch {n} ({} records): {e}", group.len()));
                }
            }
            drop(session);

            processed += done;
            progress(ChunkProgress {
                processed,
                total: records.len(),
                inserted: outcome.inserted,
                duplicates: outcome.duplicates,
            })
            .await;
            if stop {
                outcome.cancelled = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        Ok(outcome)
    }

    async fn insert_group(
        &self,
        session: &mut Session<'_>,
        savepoint: &str,
        group: &[RawPunchRecord],
        cancel: &CancellationToken,
    ) -> Result<GroupCounts, DatabaseError> {
        session.savepoint(savepoint).await?;
        let mut counts = GroupCounts::default();
        let mut params = Vec::with_capacity(self.rows_per_statement * PARAMS_PER_ROW);

        for rows in group.chunks(self.rows_per_statement) {
            if counts.processed > 0 && cancel.is_cancelled() {
                counts.cancelled = true;
                break;
            }
            params.clear();
            let ids: Vec<String> = rows
                .iter()
                .map(|record| row_params(record, &mut params))
                .collect();
            let affected = session.execute(&insert_sql(rows.len()), &params).await?;
            counts.processed += rows.len();
            counts.inserted += affected;
            counts.duplicates += rows.len().saturating_sub(affected);
            if affected > 0 {
                counts
                    .dates
                    .extend(self.inserted_dates(session, rows, &ids, affected).await?);
            }
        }

        session.release(savepoint).await?;
        Ok(counts)
    }

    /// Dates of the rows this statement created. Ignored rows never got
    /// their generated id, so the ids that made it into the table identify
    /// the new rows.
    async fn inserted_dates(
        &self,
        session: &mut Session<'_>,
        rows: &[RawPunchRecord],
        ids: &[String],
        affected: usize,
    ) -> Result<BTreeSet<NaiveDate>, DatabaseError> {
        if affected == rows.len() {
            return Ok(rows.iter().map(RawPunchRecord::date).collect());
        }
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let params: Vec<Value> = ids.iter().cloned().map(Value::from).collect();
        let dates = session
            .select(
                &format!(
                    "SELECT DISTINCT substr(timestamp, 1, 10) FROM attendance_logs_raw WHERE id IN ({placeholders})"
                ),
                &params,
                |row| row.get::<_, String>(0),
            )
            .await?;
        Ok(dates
            .iter()
            .filter_map(|d| d.parse::<NaiveDate>().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_numbers_every_placeholder() {
        let sql = insert_sql(2);
        assert!(sql.ends_with("(?1, ?2, ?3, ?4, ?5, ?6, ?7), (?8, ?9, ?10, ?11, ?12, ?13, ?14)"));
    }

    #[test]
    fn rows_per_statement_respects_parameter_limit() {
        let store = Store::open_memory().unwrap();
        let inserter = BatchInserter::new(
            store,
            &IngestConfig {
                rows_per_statement: 10_000,
                statements_per_savepoint: 0,
            },
        );
        assert_eq!(inserter.rows_per_statement, MAX_PARAMS / PARAMS_PER_ROW);
        assert_eq!(inserter.statements_per_savepoint, 1);
    }

    use crate::storage::devices::{upsert_device, Device};
    use crate::storage::punches::{count_punches, parse_timestamp};

    async fn store_with_device() -> Store {
        let store = Store::open_memory().unwrap();
        upsert_device(&store, &Device::new("dev", "Gate", "10.0.0.2"))
            .await
            .unwrap();
        store
    }

    fn small(store: &Store) -> BatchInserter {
        BatchInserter::new(
            store.clone(),
            &IngestConfig {
                rows_per_statement: 2,
                statements_per_savepoint: 2,
            },
        )
    }

    fn punch(user: &str, ts: &str) -> RawPunchRecord {
        RawPunchRecord {
            device_id: "dev".into(),
            device_user_id: user.into(),
            timestamp: parse_timestamp(ts).unwrap(),
            verify_type: 1,
            punch_type: 0,
            raw_payload: None,
        }
    }

    fn week_of_punches() -> Vec<RawPunchRecord> {
        (1..=7)
            .flat_map(|d| {
                [
                    punch("1", &format!("2024-03-0{d}T09:00:00")),
                    punch("1", &format!("2024-03-0{d}T17:00:00")),
                ]
            })
            .collect()
    }

    #[tokio::test]
    async fn second_ingest_is_all_duplicates() {
        let store = store_with_device().await;
        let inserter = small(&store);
        let records = week_of_punches();
        let cancel = CancellationToken::new();

        let first = inserter.insert_punches(&records, |_| async {}, &cancel).await.unwrap();
        assert_eq!(first.inserted, 14);
        assert_eq!(first.duplicates, 0);
        assert_eq!(first.inserted_dates.len(), 7);

        let second = inserter.insert_punches(&records, |_| async {}, &cancel).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 14);
        assert!(second.inserted_dates.is_empty());
        assert!(second.errors.is_empty());
        assert_eq!(count_punches(&store, Some("dev")).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn duplicates_within_one_call_collapse() {
        let store = store_with_device().await;
        let records = vec![punch("1", "2024-03-04T09:00:00"); 5];
        let outcome = small(&store)
            .insert_punches(&records, |_| async {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 4);
        assert_eq!(count_punches(&store, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn only_dates_of_new_rows_are_reported() {
        let store = store_with_device().await;
        let inserter = small(&store);
        let cancel = CancellationToken::new();
        inserter
            .insert_punches(&[punch("1", "2024-03-04T09:00:00")], |_| async {}, &cancel)
            .await
            .unwrap();

        let outcome = inserter
            .insert_punches(
                &[punch("1", "2024-03-04T09:00:00"), punch("1", "2024-03-05T09:00:00")],
                |_| async {},
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(
            outcome.inserted_dates.into_iter().collect::<Vec<_>>(),
            vec![NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()]
        );
    }

    #[tokio::test]
    async fn failing_group_is_rolled_back_alone() {
        let store = store_with_device().await;
        store
            .execute(
                "CREATE TRIGGER poison BEFORE INSERT ON attendance_logs_raw
                 WHEN NEW.device_user_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poison record'); END",
                &[],
            )
            .await
            .unwrap();

        // groups of 4: [ok ok ok ok] [ok poison ok ok] [ok ok]
        let mut records: Vec<RawPunchRecord> = (0..10)
            .map(|i| punch("1", &format!("2024-03-04T10:{i:02}:00")))
            .collect();
        records[5].device_user_id = "poison".into();

        let mut seen = Vec::new();
        let outcome = small(&store)
            .insert_punches(
                &records,
                |p| {
                    seen.push(p);
                    async {}
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("poison"));
        assert_eq!(outcome.inserted, 6);
        assert_eq!(count_punches(&store, None).await.unwrap(), 6);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().map(|p| p.processed), Some(10));
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let store = store_with_device().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = small(&store)
            .insert_punches(&week_of_punches(), |_| async {}, &cancel)
            .await
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(count_punches(&store, None).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_inside_a_group_keeps_committed_statements() {
        let store = store_with_device().await;
        let start = parse_timestamp("2024-03-04T00:00:00").unwrap();
        let records: Vec<RawPunchRecord> = (0..20_000i64)
            .map(|i| RawPunchRecord {
                timestamp: start + chrono::Duration::seconds(i),
                ..punch("1", "2024-03-04T00:00:00")
            })
            .collect();
        // one group holding every record, one row per statement
        let inserter = BatchInserter::new(
            store.clone(),
            &IngestConfig {
                rows_per_statement: 1,
                statements_per_savepoint: records.len(),
            },
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(2));
            trigger.cancel();
        });

        let mut seen = Vec::new();
        let outcome = inserter
            .insert_punches(
                &records,
                |p| {
                    seen.push(p);
                    async {}
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.inserted < records.len());
        assert!(outcome.errors.is_empty());
        assert_eq!(count_punches(&store, None).await.unwrap() as usize, outcome.inserted);
        if outcome.inserted > 0 {
            assert_eq!(seen.last().map(|p| p.processed), Some(outcome.inserted));
        }
    }
}
