//! Job ledger.
//!
//! One row per logical job. The dispatcher creates and resubmits rows, the
//! worker completion hook finishes them. A row's state is never stored: it is
//! derived on every read from `finished_at` and the age of `created_at`, so
//! a crashed worker simply ages its row into `Stale`.

mod types;

pub use types::{JobKey, JobRecord, JobState, LedgerError, classify};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;

const AGE_EXPR: &str =
    "CAST(strftime('%s', 'now') - strftime('%s', created_at) AS INTEGER)";

pub struct JobLedger {
    db: Arc<Mutex<Connection>>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl JobLedger {
    pub async fn open<P: AsRef<Path>>(
        db_path: P,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        crate::core::config::ensure_parent_dir(db_path).await?;
        let db = Connection::open(db_path)
            .with_context(|| format!("opening ledger {}", db_path.display()))?;
        Self::from_connection(db, timeout, retry)
    }

    pub fn from_connection(db: Connection, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        db.busy_timeout(Duration::from_secs(5))?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS analysis_jobs (
                workflow_id TEXT NOT NULL,
                variant TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                finished_at TEXT,
                PRIMARY KEY (workflow_id, variant)
            );
            CREATE TABLE IF NOT EXISTS titration_jobs (
                workflow_id TEXT NOT NULL,
                variant TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                finished_at TEXT,
                PRIMARY KEY (workflow_id, variant)
            );
            CREATE TABLE IF NOT EXISTS stitching_jobs (
                plate_name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                finished_at TEXT
            );",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            timeout,
            retry,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn record(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        let this = self;
        self.retry
            .run("ledger.record", move || async move {
                let db = this.db.lock().await;
                read_record(&db, key)
            })
            .await
    }

    pub async fn state(&self, key: &JobKey) -> Result<JobState> {
        let record = self.record(key).await?;
        let state = classify(record.as_ref(), self.timeout);
        debug!("{} is {}", key, state);
        Ok(state)
    }

    /// Insert a row for `key`. Creating an unfinished row again refreshes
    /// its `created_at`; a finished row is left untouched.
    pub async fn create(&self, key: &JobKey) -> Result<()> {
        let columns = key.key_columns().join(", ");
        let placeholders = (1..=key.key_columns().len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({columns}) VALUES ({placeholders})
             ON CONFLICT({columns}) DO UPDATE SET created_at = CURRENT_TIMESTAMP
             WHERE finished_at IS NULL",
            table = key.table(),
        );
        let this = self;
        let sql = sql.as_str();
        self.retry
            .run("ledger.create", move || async move {
                let db = this.db.lock().await;
                db.execute(sql, params_from_iter(key.key_values()))?;
                Ok(())
            })
            .await?;
        info!("Ledger row created for {}", key);
        Ok(())
    }

    /// Reset `created_at` on an unfinished row before re-enqueueing it.
    pub async fn resubmit(&self, key: &JobKey) -> Result<()> {
        let this = self;
        self.retry
            .run("ledger.resubmit", move || async move {
                let db = this.db.lock().await;
                match finished_at(&db, key)? {
                    None => return Err(LedgerError::MissingRecord(key.clone()).into()),
                    Some(Some(_)) => return Err(LedgerError::AlreadyFinished(key.clone()).into()),
                    Some(None) => {}
                }
                db.execute(
                    &format!(
                        "UPDATE {} SET created_at = CURRENT_TIMESTAMP
                         WHERE {} AND finished_at IS NULL",
                        key.table(),
                        key.where_clause()
                    ),
                    params_from_iter(key.key_values()),
                )?;
                Ok(())
            })
            .await?;
        info!("Ledger row resubmitted for {}", key);
        Ok(())
    }

    /// Set `finished_at`. Returns `false` when the row was already finished,
    /// in which case the first timestamp is kept.
    pub async fn mark_finished(&self, key: &JobKey) -> Result<bool> {
        let this = self;
        let updated = self
            .retry
            .run("ledger.mark_finished", move || async move {
                let db = this.db.lock().await;
                let changed = db.execute(
                    &format!(
                        "UPDATE {} SET finished_at = CURRENT_TIMESTAMP
                         WHERE {} AND finished_at IS NULL",
                        key.table(),
                        key.where_clause()
                    ),
                    params_from_iter(key.key_values()),
                )?;
                if changed > 0 {
                    return Ok(true);
                }
                match finished_at(&db, key)? {
                    None => Err(LedgerError::MissingRecord(key.clone()).into()),
                    Some(_) => Ok(false),
                }
            })
            .await?;
        if updated {
            info!("Ledger row finished for {}", key);
        } else {
            warn!("{} was already finished, keeping first timestamp", key);
        }
        Ok(updated)
    }

    pub async fn analysis_records(&self) -> Result<Vec<JobRecord>> {
        self.list(
            "SELECT workflow_id, variant, created_at, finished_at, {age} FROM analysis_jobs
             ORDER BY workflow_id, variant",
            |row| Ok(JobKey::analysis(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            2,
        )
        .await
    }

    pub async fn stitching_records(&self) -> Result<Vec<JobRecord>> {
        self.list(
            "SELECT plate_name, created_at, finished_at, {age} FROM stitching_jobs
             ORDER BY plate_name",
            |row| Ok(JobKey::stitching(row.get::<_, String>(0)?)),
            1,
        )
        .await
    }

    /// Rows of one table. `first_col` is the index of `created_at`.
    async fn list(
        &self,
        sql: &str,
        key_of: fn(&Row<'_>) -> rusqlite::Result<JobKey>,
        first_col: usize,
    ) -> Result<Vec<JobRecord>> {
        let sql = sql.replace("{age}", AGE_EXPR);
        let this = self;
        let sql = sql.as_str();
        self.retry
            .run("ledger.list", move || async move {
                let db = this.db.lock().await;
                let mut stmt = db.prepare(sql)?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        key_of(row)?,
                        row.get::<_, String>(first_col)?,
                        row.get::<_, Option<String>>(first_col + 1)?,
                        row.get::<_, Option<i64>>(first_col + 2)?,
                    ))
                })?;
                let mut records = Vec::new();
                for row in rows {
                    let (key, created_at, finished_at, age) = row?;
                    records.push(to_record(key, created_at, finished_at, age)?);
                }
                Ok(records)
            })
            .await
    }
}

fn read_record(db: &Connection, key: &JobKey) -> Result<Option<JobRecord>> {
    let sql = format!(
        "SELECT created_at, finished_at, {} FROM {} WHERE {}",
        AGE_EXPR,
        key.table(),
        key.where_clause()
    );
    let row = db
        .query_row(&sql, params_from_iter(key.key_values()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })
        .optional()?;
    match row {
        Some((created_at, finished_at, age)) => {
            Ok(Some(to_record(key.clone(), created_at, finished_at, age)?))
        }
        None => Ok(None),
    }
}

/// `None` when no row exists, `Some(finished_at)` otherwise.
fn finished_at(db: &Connection, key: &JobKey) -> Result<Option<Option<String>>> {
    let sql = format!(
        "SELECT finished_at FROM {} WHERE {}",
        key.table(),
        key.where_clause()
    );
    Ok(db
        .query_row(&sql, params_from_iter(key.key_values()), |row| row.get(0))
        .optional()?)
}

fn to_record(
    key: JobKey,
    created_at: String,
    finished_at: Option<String>,
    age: Option<i64>,
) -> Result<JobRecord> {
    match age {
        Some(age_secs) => Ok(JobRecord {
            key,
            created_at,
            finished_at,
            age_secs,
        }),
        None => Err(LedgerError::CorruptRecord {
            key,
            value: created_at,
        }
        .into()),
    }
}

#[cfg(test)]
pub(crate) fn test_ledger() -> JobLedger {
    JobLedger::from_connection(
        Connection::open_in_memory().unwrap(),
        Duration::from_secs(30 * 60),
        RetryPolicy::none(),
    )
    .unwrap()
}

#[cfg(test)]
impl JobLedger {
    /// Move `created_at` into the past.
    pub(crate) async fn backdate(&self, key: &JobKey, minutes: i64) {
        let n = key.key_columns().len();
        let sql = format!(
            "UPDATE {} SET created_at = datetime('now', ?{}) WHERE {}",
            key.table(),
            n + 1,
            key.where_clause()
        );
        let mut values: Vec<String> = key.key_values().iter().map(|v| v.to_string()).collect();
        values.push(format!("-{} minutes", minutes));
        let db = self.db.lock().await;
        db.execute(&sql, params_from_iter(values)).unwrap();
    }

    pub(crate) async fn overwrite_created_at(&self, key: &JobKey, raw: &str) {
        let n = key.key_columns().len();
        let sql = format!(
            "UPDATE {} SET created_at = ?{} WHERE {}",
            key.table(),
            n + 1,
            key.where_clause()
        );
        let mut values: Vec<String> = key.key_values().iter().map(|v| v.to_string()).collect();
        values.push(raw.to_string());
        let db = self.db.lock().await;
        db.execute(&sql, params_from_iter(values)).unwrap();
    }
}

#[cfg(test)]
mod tests;
