//! Host sampling loop
//!
//! Periodically records a host CPU sample into the sample store and prunes
//! samples that fell out of retention.

use super::CpuSampler;
use crate::health::{components, HealthRegistry};
use crate::observability::GovernorMetrics;
use crate::store::SampleStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consecutive failures before the sampler is reported unhealthy
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

pub struct SamplingLoop {
    sampler: Arc<dyn CpuSampler>,
    store: Arc<dyn SampleStore>,
    interval: Duration,
    health: HealthRegistry,
    metrics: GovernorMetrics,
    consecutive_failures: u32,
}

impl SamplingLoop {
    pub fn new(
        sampler: Arc<dyn CpuSampler>,
        store: Arc<dyn SampleStore>,
        interval: Duration,
        health: HealthRegistry,
    ) -> Self {
        Self {
            sampler,
            store,
            interval: interval.max(Duration::from_millis(100)),
            health,
            metrics: GovernorMetrics::new(),
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting host sampling loop"
        );
        self.health.register(components::SAMPLER).await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down host sampling loop");
                    break;
                }
            }
        }
    }

    /// One sampling pass; failures are reported through health, never returned
    pub(crate) async fn tick(&mut self) {
        match self.collect_once().await {
            Ok(recorded) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "Host sampling recovered"
                    );
                    self.health.set_healthy(components::SAMPLER).await;
                }
                self.consecutive_failures = 0;
                if recorded {
                    self.metrics.inc_samples_collected();
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    "Failed to sample host CPU"
                );
                let message = format!("sampling failed: {:#}", e);
                if self.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                    self.health.set_unhealthy(components::SAMPLER, message).await;
                } else {
                    self.health.set_degraded(components::SAMPLER, message).await;
                }
            }
        }
    }

    /// Take a reading and store it. Returns whether a sample was recorded.
    pub(crate) async fn collect_once(&self) -> Result<bool> {
        let recorded = match self.sampler.sample().await? {
            Some(sample) => {
                debug!(cpu_percent = sample.cpu_percent, "Recorded host sample");
                self.store.append(sample).await?;
                true
            }
            None => false,
        };

        // a failed prune only delays eviction until the next pass
        if let Err(e) = self.store.prune(Utc::now()).await {
            warn!(error = %e, "Failed to prune expired samples");
        }
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::models::Sample;
    use crate::store::MemorySampleStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails on demand, otherwise returns a fixed reading
    struct MockSampler {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockSampler {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl CpuSampler for MockSampler {
        async fn sample(&self) -> Result<Option<Sample>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("no /proc/stat");
            }
            if call == 0 {
                return Ok(None);
            }
            Ok(Some(Sample::new(Utc::now(), 42.0)))
        }
    }

    #[tokio::test]
    async fn test_baseline_reading_records_nothing() {
        let store = Arc::new(MemorySampleStore::default());
        let sampling = SamplingLoop::new(
            Arc::new(MockSampler::new(false)),
            store.clone(),
            Duration::from_secs(1),
            HealthRegistry::new(),
        );

        assert!(!sampling.collect_once().await.unwrap());
        assert!(sampling.collect_once().await.unwrap());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.latest().await.unwrap().unwrap().cpu_percent, 42.0);
    }

    #[tokio::test]
    async fn test_repeated_failures_mark_sampler_unhealthy() {
        let health = HealthRegistry::new();
        let mut sampling = SamplingLoop::new(
            Arc::new(MockSampler::new(true)),
            Arc::new(MemorySampleStore::default()),
            Duration::from_secs(1),
            health.clone(),
        );

        sampling.tick().await;
        assert_eq!(
            health.get(components::SAMPLER).await.unwrap().status,
            ComponentStatus::Degraded
        );

        sampling.tick().await;
        sampling.tick().await;
        assert_eq!(
            health.get(components::SAMPLER).await.unwrap().status,
            ComponentStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let store = Arc::new(MemorySampleStore::default());
        let sampling = SamplingLoop::new(
            Arc::new(MockSampler::new(false)),
            store.clone(),
            Duration::from_millis(100),
            HealthRegistry::new(),
        );

        let handle = tokio::spawn(sampling.run(rx));
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!store.is_empty().await);
    }
}
