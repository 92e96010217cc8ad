//! Result persistence and offline buffering.
//!
//! [`ResultSink`] is the only contract the run depends on. [`SqliteSink`]
//! stores readings through sqlx. [`OfflineBuffer`] keeps every reading a
//! sink refused until a later save succeeds.

use crate::config::StorageConfig;
use crate::error::PersistenceError;
use crate::measurement::Reading;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Persistence target for readings.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores a batch. Either the whole batch is stored or none of it is.
    async fn save(&self, readings: &[Reading]) -> Result<(), PersistenceError>;

    /// Cheap reachability check.
    async fn is_available(&self) -> bool;
}

/// SQLite-backed sink.
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Opens the pool and creates the table when missing.
    pub async fn connect(settings: &StorageConfig) -> Result<Self, PersistenceError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.database_url)
            .await?;

        let sink = Self { pool };
        sink.init_tables().await?;
        info!(url = %settings.database_url, "Result database ready");
        Ok(sink)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dust_measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                measured_at TEXT NOT NULL,
                room TEXT NOT NULL,
                area TEXT NOT NULL,
                location_name TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                um01 INTEGER NOT NULL,
                um02 INTEGER NOT NULL,
                um03 INTEGER NOT NULL,
                um05 INTEGER NOT NULL,
                um07 INTEGER NOT NULL,
                um10 INTEGER NOT NULL,
                running_state INTEGER NOT NULL,
                alarm_high INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dust_measurements_location
                ON dust_measurements(location_name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of stored readings.
    pub async fn count(&self) -> Result<i64, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dust_measurements")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// `(attempt, alarm_high)` of every stored reading for `point`, oldest first.
    pub async fn attempts_for(&self, point: &str) -> Result<Vec<(u32, bool)>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT attempt, alarm_high FROM dust_measurements
                WHERE location_name = ? ORDER BY id",
        )
        .bind(point)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<u32, _>("attempt"), row.get::<bool, _>("alarm_high")))
            .collect())
    }

    /// Closes the pool; later saves fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ResultSink for SqliteSink {
    async fn save(&self, readings: &[Reading]) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        for reading in readings {
            sqlx::query(
                "INSERT INTO dust_measurements
                    (measured_at, room, area, location_name, attempt,
                     um01, um02, um03, um05, um07, um10, running_state, alarm_high)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(reading.measured_at.naive_local())
            .bind(&reading.room)
            .bind(&reading.area)
            .bind(&reading.point)
            .bind(reading.attempt)
            .bind(reading.counts.um01)
            .bind(reading.counts.um02)
            .bind(reading.counts.um03)
            .bind(reading.counts.um05)
            .bind(reading.counts.um07)
            .bind(reading.counts.um10)
            .bind(reading.running_state)
            .bind(reading.alarm_high)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = readings.len(), "Readings stored");
        Ok(())
    }

    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Outcome of one [`OfflineBuffer::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Readings stored by this flush.
    pub flushed: usize,
    /// Readings left in the buffer once the flush returned.
    pub still_buffered: usize,
}

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    queue: VecDeque<(u64, Reading)>,
}

/// Readings that failed persistence, in the order they failed.
///
/// An entry stays in the buffer until a save of exactly that entry
/// succeeds, so a flush that is slow, failing or dropped halfway never
/// hides a reading from [`len`](Self::len).
#[derive(Debug, Default)]
pub struct OfflineBuffer {
    entries: Mutex<Entries>,
}

impl OfflineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a reading that could not be stored.
    pub fn push(&self, reading: Reading) {
        let mut entries = self.entries();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.queue.push_back((seq, reading));
        debug!(buffered = entries.queue.len(), "Reading buffered offline");
    }

    /// Number of readings awaiting persistence.
    pub fn len(&self) -> usize {
        self.entries().queue.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries().queue.is_empty()
    }

    /// Copy of the buffered readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.entries()
            .queue
            .iter()
            .map(|(_, reading)| reading.clone())
            .collect()
    }

    /// Retries every buffered reading once, one save per reading.
    ///
    /// Readings that are stored leave the buffer; the rest stay in their
    /// original order, ahead of anything buffered while the flush ran.
    pub async fn flush(&self, sink: &dyn ResultSink) -> FlushReport {
        let pending: Vec<(u64, Reading)> = self.entries().queue.iter().cloned().collect();
        if pending.is_empty() {
            return FlushReport::default();
        }
        info!(pending = pending.len(), "Flushing offline buffer");

        let mut flushed = 0;
        for (seq, reading) in pending {
            match sink.save(std::slice::from_ref(&reading)).await {
                Ok(()) => {
                    self.entries().queue.retain(|(kept, _)| *kept != seq);
                    flushed += 1;
                }
                Err(err) => {
                    warn!(point = %reading.point, attempt = reading.attempt, error = %err, "Still unable to store reading");
                }
            }
        }

        FlushReport {
            flushed,
            still_buffered: self.len(),
        }
    }
}
