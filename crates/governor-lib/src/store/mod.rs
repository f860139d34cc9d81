//! Sample storage
//!
//! The control loop reads history through `SampleStore`; the sampler writes
//! to it. `SqliteSampleStore` keeps samples on disk so the window survives a
//! restart; `MemorySampleStore` keeps a retention-bounded ring in memory.

mod sqlite;

pub use sqlite::SqliteSampleStore;

use crate::models::Sample;
use crate::window::to_chrono;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Default retention (25 hours, one day plus a margin)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(25 * 60 * 60);

/// Default maximum number of retained samples
pub const DEFAULT_MAX_SAMPLES: usize = 200_000;

/// Time-series source of CPU samples
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Samples with `since <= timestamp <= until`, ascending.
    /// Sparse or empty ranges are not errors.
    async fn query(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<Sample>>;

    /// Record a new sample
    async fn append(&self, sample: Sample) -> Result<()>;

    /// Most recent sample, if any
    async fn latest(&self) -> Result<Option<Sample>>;

    /// Drop samples that fell out of retention as of `now`.
    /// Returns how many were removed.
    async fn prune(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory ring of samples ordered by timestamp
pub struct MemorySampleStore {
    samples: RwLock<VecDeque<Sample>>,
    retention: Duration,
    max_samples: usize,
}

impl Default for MemorySampleStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MAX_SAMPLES)
    }
}

impl MemorySampleStore {
    pub fn new(retention: Duration, max_samples: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(max_samples.min(10_000))),
            retention,
            max_samples: max_samples.max(1),
        }
    }

    /// Store pre-populated with samples (any order)
    pub fn with_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut sorted: Vec<Sample> = samples.into_iter().collect();
        sorted.sort_by_key(|s| s.timestamp);
        Self {
            max_samples: DEFAULT_MAX_SAMPLES.max(sorted.len()),
            samples: RwLock::new(sorted.into()),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn query(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<Sample>> {
        let samples = self.samples.read().await;
        let start = samples.partition_point(|s| s.timestamp < since);
        Ok(samples
            .range(start..)
            .take_while(|s| s.timestamp <= until)
            .cloned()
            .collect())
    }

    async fn append(&self, sample: Sample) -> Result<()> {
        let mut samples = self.samples.write().await;

        // Keep ascending order if a sample arrives late
        match samples.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                let index = samples.partition_point(|s| s.timestamp <= sample.timestamp);
                samples.insert(index, sample);
            }
            _ => samples.push_back(sample),
        }

        while samples.len() > self.max_samples {
            samples.pop_front();
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Sample>> {
        Ok(self.samples.read().await.back().cloned())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = now.checked_sub_signed(to_chrono(self.retention)) else {
            return Ok(0);
        };

        let mut samples = self.samples.write().await;
        let before = samples.len();
        while samples.front().is_some_and(|s| s.timestamp < cutoff) {
            samples.pop_front();
        }

        let removed = before - samples.len();
        if removed > 0 {
            debug!(removed, remaining = samples.len(), "Pruned expired samples");
        }
        Ok(removed)
    }
}
