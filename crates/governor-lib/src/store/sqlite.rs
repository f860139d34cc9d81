//! SQLite-backed sample store

use super::SampleStore;
use crate::models::Sample;
use crate::window::to_chrono;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    timestamp_ms INTEGER NOT NULL,
    cpu_percent REAL NOT NULL,
    aux TEXT
);
CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples (timestamp_ms);
";

/// Raw row as stored: millisecond timestamp, percent, aux JSON
type Row = (i64, f64, Option<String>);

/// Samples persisted in a SQLite file, so the trailing window survives a
/// restart of the governor
pub struct SqliteSampleStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    retention: Duration,
}

impl SqliteSampleStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open sample database {}", path.display()))?;

        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create samples schema")?;

        let existing: i64 = conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?;
        info!(path = %path.display(), samples = existing, "Opened sample database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            retention,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn len(&self) -> Result<usize> {
        let count: i64 = self
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0)))
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .context("Sample database task panicked")?;
        Ok(result?)
    }
}

fn encode(sample: &Sample) -> Result<Row> {
    let aux = if sample.aux.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&sample.aux).context("Failed to encode aux series")?)
    };
    Ok((sample.timestamp.timestamp_millis(), sample.cpu_percent, aux))
}

/// Rows with an unreadable timestamp or aux payload are skipped
fn decode((timestamp_ms, cpu_percent, aux): Row) -> Option<Sample> {
    let Some(timestamp) = Utc.timestamp_millis_opt(timestamp_ms).single() else {
        warn!(timestamp_ms, "Skipping stored sample with invalid timestamp");
        return None;
    };

    let aux = match aux {
        Some(json) => match serde_json::from_str::<BTreeMap<String, f64>>(&json) {
            Ok(aux) => aux,
            Err(e) => {
                warn!(timestamp_ms, error = %e, "Skipping stored sample with invalid aux series");
                return None;
            }
        },
        None => BTreeMap::new(),
    };

    Some(Sample {
        timestamp,
        cpu_percent,
        aux,
    })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

#[async_trait]
impl SampleStore for SqliteSampleStore {
    async fn query(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<Sample>> {
        let (since, until) = (since.timestamp_millis(), until.timestamp_millis());
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT timestamp_ms, cpu_percent, aux FROM samples
                     WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2
                     ORDER BY timestamp_ms ASC",
                )?;
                let rows = stmt.query_map(params![since, until], read_row)?;
                rows.collect::<rusqlite::Result<Vec<Row>>>()
            })
            .await?;

        Ok(rows.into_iter().filter_map(decode).collect())
    }

    async fn append(&self, sample: Sample) -> Result<()> {
        let (timestamp_ms, cpu_percent, aux) = encode(&sample)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO samples (timestamp_ms, cpu_percent, aux) VALUES (?1, ?2, ?3)",
                params![timestamp_ms, cpu_percent, aux],
            )
        })
        .await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Sample>> {
        let row = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT timestamp_ms, cpu_percent, aux FROM samples
                     ORDER BY timestamp_ms DESC LIMIT 1",
                    [],
                    read_row,
                )
                .optional()
            })
            .await?;
        Ok(row.and_then(decode))
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(to_chrono(self.retention)) else {
            return Ok(0);
        };
        let cutoff = cutoff.timestamp_millis();

        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM samples WHERE timestamp_ms < ?1", params![cutoff])
            })
            .await?;
        if removed > 0 {
            debug!(removed, "Pruned expired samples");
        }
        Ok(removed)
    }
}
