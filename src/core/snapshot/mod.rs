//! Directory snapshots.
//!
//! The results directory lives on a network mount that does not deliver
//! reliable filesystem events, so change detection is a poll: list the
//! directory, hash the sorted listing and compare it with the digest stored on
//! the previous run. Only when the digest moved do we diff individual names.
//! The stored set is replaced wholesale on every commit so deleted or renamed
//! exports never leak into later diffs.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::errors::EnvironmentError;
use crate::core::retry::RetryPolicy;

/// `{prefix}*{suffix}` glob on export folder names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    pub prefix: String,
    pub suffix: String,
}

impl NameFilter {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }
}

/// Sorted matching directory names plus their digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub names: Vec<String>,
    pub digest: String,
}

impl Listing {
    pub fn from_names(names: impl IntoIterator<Item = String>) -> Self {
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        names.dedup();
        let digest = digest(&names);
        Self { names, digest }
    }
}

/// SHA-256 over the sorted names joined by a single space.
pub fn digest<S: AsRef<str>>(names: &[S]) -> String {
    let mut sorted: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(sorted.join(" ").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct SnapshotStore {
    db: Arc<Mutex<Connection>>,
    results_dir: PathBuf,
    filter: NameFilter,
    retry: RetryPolicy,
}

impl SnapshotStore {
    pub async fn open<P: AsRef<Path>>(
        db_path: P,
        results_dir: impl Into<PathBuf>,
        filter: NameFilter,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        crate::core::config::ensure_parent_dir(db_path).await?;
        let db = Connection::open(db_path)
            .with_context(|| format!("opening snapshot db {}", db_path.display()))?;
        Self::from_connection(db, results_dir, filter, retry)
    }

    pub fn from_connection(
        db: Connection,
        results_dir: impl Into<PathBuf>,
        filter: NameFilter,
        retry: RetryPolicy,
    ) -> Result<Self> {
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshot (
                name TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS digest (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            results_dir: results_dir.into(),
            filter,
            retry,
        })
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Names outside this filter are never plate exports of this target.
    pub fn filter(&self) -> &NameFilter {
        &self.filter
    }

    /// List the results directory. An empty match set is treated as a mount
    /// failure, never as "nothing new".
    pub async fn scan(&self) -> Result<Listing> {
        let mut entries = tokio::fs::read_dir(&self.results_dir)
            .await
            .map_err(|e| EnvironmentError::Unreadable {
                path: self.results_dir.clone(),
                source: e,
            })?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.filter.matches(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(EnvironmentError::EmptyListing {
                path: self.results_dir.clone(),
                prefix: self.filter.prefix.clone(),
                suffix: self.filter.suffix.clone(),
            }
            .into());
        }
        let listing = Listing::from_names(names);
        debug!(
            "{} matching entries in {}",
            listing.names.len(),
            self.results_dir.display()
        );
        Ok(listing)
    }

    pub async fn current_digest(&self) -> Result<String> {
        Ok(self.scan().await?.digest)
    }

    pub async fn stored_digest(&self) -> Result<Option<String>> {
        let this = self;
        self.retry
            .run("snapshot.stored_digest", move || async move {
                let db = this.db.lock().await;
                let value = db
                    .query_row("SELECT value FROM digest WHERE id = 1", [], |row| row.get(0))
                    .optional()?;
                Ok(value)
            })
            .await
    }

    /// Names in `listing` that were not present in the stored snapshot.
    pub async fn new_entries(&self, listing: &Listing) -> Result<BTreeSet<String>> {
        let this = self;
        self.retry
            .run("snapshot.new_entries", move || async move {
                let db = this.db.lock().await;
                let mut stmt = db.prepare("SELECT 1 FROM snapshot WHERE name = ?1")?;
                let mut fresh = BTreeSet::new();
                for name in &listing.names {
                    if !stmt.exists(params![name])? {
                        fresh.insert(name.clone());
                    }
                }
                Ok(fresh)
            })
            .await
    }

    /// Replace the stored set and digest in one transaction.
    pub async fn commit(&self, listing: &Listing) -> Result<()> {
        let this = self;
        self.retry
            .run("snapshot.commit", move || async move {
                let mut db = this.db.lock().await;
                let tx = db.transaction()?;
                tx.execute("DELETE FROM snapshot", [])?;
                {
                    let mut insert = tx.prepare("INSERT OR IGNORE INTO snapshot (name) VALUES (?1)")?;
                    for name in &listing.names {
                        insert.execute(params![name])?;
                    }
                }
                tx.execute(
                    "INSERT INTO digest (id, value) VALUES (1, ?1)
                     ON CONFLICT(id) DO UPDATE SET value = excluded.value",
                    params![listing.digest],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        info!(
            "Snapshot committed: {} entries, digest {}",
            listing.names.len(),
            &listing.digest[..12.min(listing.digest.len())]
        );
        Ok(())
    }

    /// Full path of a snapshot entry.
    pub fn entry_path(&self, name: &str) -> PathBuf {
        self.results_dir.join(name)
    }
}
