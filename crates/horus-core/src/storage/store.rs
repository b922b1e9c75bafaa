//! Storage access layer over a single SQLite connection.
//!
//! The embedded store allows one writer at a time, so the connection is
//! opened in WAL mode with a busy timeout and every statement goes through
//! [`retry_locked`], which retries `SQLITE_BUSY`/`SQLITE_LOCKED` with
//! exponential backoff plus jitter. Lock contention is only visible to a
//! caller once the retry budget is spent, as [`DatabaseError::Locked`].
//!
//! Callers either issue one-shot statements through [`Store`], or take a
//! [`Session`] to keep the connection for a unit of work that spans
//! savepoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tokio::sync::{Mutex, MutexGuard};

use super::config::{RetryConfig, StorageConfig};
use super::migrations;
use crate::error::DatabaseError;

/// Shared handle to the attendance database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    retry: Arc<RetryConfig>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply migrations.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened, configured or
    /// migrated.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn, config)
    }

    /// Open an in-memory database (tests and dry runs).
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, &StorageConfig::default())
    }

    fn from_connection(conn: Connection, config: &StorageConfig) -> Result<Self, DatabaseError> {
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %journal_mode, "database opened");
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        migrations::migrate(&conn)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: Arc::new(config.retry.clone()),
        })
    }

    /// Run one statement, returning the number of affected rows.
    ///
    /// # Errors
    /// Returns an error if the statement fails or lock contention outlasts
    /// the retry budget.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, DatabaseError> {
        self.session().await.execute(sql, params).await
    }

    /// Run one query and map every row.
    ///
    /// # Errors
    /// Returns an error if the query or a row mapping fails.
    pub async fn select<T, F>(
        &self,
        sql: &str,
        params: &[Value],
        map: F,
    ) -> Result<Vec<T>, DatabaseError>
    where
        T: Send,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send,
    {
        self.session().await.select(sql, params, map).await
    }

    /// Run one query expected to return at most one row.
    ///
    /// # Errors
    /// Returns an error if the query or the row mapping fails.
    pub async fn select_optional<T, F>(
        &self,
        sql: &str,
        params: &[Value],
        map: F,
    ) -> Result<Option<T>, DatabaseError>
    where
        T: Send,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send,
    {
        Ok(self.select(sql, params, map).await?.into_iter().next())
    }

    /// Acquire the connection for a multi-statement unit of work.
    ///
    /// Other users of the store wait until the session is dropped, so keep
    /// sessions short and drop them before yielding between batches.
    pub async fn session(&self) -> Session<'_> {
        Session {
            conn: self.conn.lock().await,
            retry: &self.retry,
        }
    }
}

/// Exclusive use of the connection for a unit of work.
pub struct Session<'a> {
    conn: MutexGuard<'a, Connection>,
    retry: &'a RetryConfig,
}

impl Session<'_> {
    /// Run one statement, returning the number of affected rows.
    ///
    /// # Errors
    /// Returns an error if the statement fails or stays locked.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, DatabaseError> {
        retry_locked(&mut self.conn, self.retry, |conn| {
            conn.execute(sql, params_from_iter(params.iter()))
        })
        .await
    }

    /// Run one query and map every row.
    ///
    /// # Errors
    /// Returns an error if the query or a row mapping fails.
    pub async fn select<T, F>(
        &mut self,
        sql: &str,
        params: &[Value],
        mut map: F,
    ) -> Result<Vec<T>, DatabaseError>
    where
        T: Send,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send,
    {
        retry_locked(&mut self.conn, self.retry, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter()), &mut map)?;
            let collected = rows.collect::<rusqlite::Result<Vec<T>>>();
            collected
        })
        .await
    }

    /// `SAVEPOINT <name>`
    ///
    /// # Errors
    /// Returns an error for a non-identifier name or a failed statement.
    pub async fn savepoint(&mut self, name: &str) -> Result<(), DatabaseError> {
        self.control(&format!("SAVEPOINT {}", checked_name(name)?)).await
    }

    /// `RELEASE SAVEPOINT <name>`
    ///
    /// # Errors
    /// Returns an error for a non-identifier name or a failed statement.
    pub async fn release(&mut self, name: &str) -> Result<(), DatabaseError> {
        self.control(&format!("RELEASE SAVEPOINT {}", checked_name(name)?))
            .await
    }

    /// `ROLLBACK TO SAVEPOINT <name>`; the savepoint stays open and must
    /// still be released.
    ///
    /// # Errors
    /// Returns an error for a non-identifier name or a failed statement.
    pub async fn rollback_to(&mut self, name: &str) -> Result<(), DatabaseError> {
        self.control(&format!("ROLLBACK TO SAVEPOINT {}", checked_name(name)?))
            .await
    }

    /// Roll back and release a savepoint after a failed unit of work.
    /// Errors are logged, the caller reports the failure that triggered the rollback.
    pub async fn abandon(&mut self, name: &str) {
        if let Err(e) = self.rollback_to(name).await {
            tracing::warn!(savepoint = name, error = %e, "rollback to savepoint failed");
        }
        if let Err(e) = self.release(name).await {
            tracing::warn!(savepoint = name, error = %e, "release after rollback failed");
        }
    }

    async fn control(&mut self, sql: &str) -> Result<(), DatabaseError> {
        retry_locked(&mut self.conn, self.retry, |conn| conn.execute_batch(sql)).await
    }
}

fn checked_name(name: &str) -> Result<&str, DatabaseError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidSavepoint(name.to_string()))
    }
}

/// Backoff before retry number `attempt + 1`: `base * 2^attempt`, capped,
/// plus up to `jitter_ms` of random delay.
pub(crate) fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exp = policy
        .base_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(policy.max_backoff_ms);
    let jitter = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

/// Run `op`, retrying lock contention with backoff up to
/// `policy.max_attempts` total attempts.
pub(crate) async fn retry_locked<T, F>(
    conn: &mut Connection,
    policy: &RetryConfig,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut(&mut Connection) -> rusqlite::Result<T> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(conn).map_err(DatabaseError::from) {
            Err(DatabaseError::Locked) if attempt + 1 < max_attempts => {
                let delay = backoff_delay(policy, attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "database locked, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(DatabaseError::Locked) => {
                tracing::warn!(attempts = max_attempts, "database still locked, giving up");
                return Err(DatabaseError::Locked);
            }
            other => return other,
        }
    }
}
