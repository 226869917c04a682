//! Observability: histogram metrics for queue wait / execution timing, and the
//! provider request counter with debounced persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::translate::store::PersistentStore;

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

/// Stores histograms for all named metrics.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        debug!(metric = name, value_us = value_us, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (0-100) for a metric, in microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists.get(name).map(|ring| ring.percentile(p)).unwrap_or(0.0)
    }

    /// Summary of all metrics at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        hists
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Well-known metric names.
pub mod metric_names {
    pub const QUEUE_WAIT_HIGH: &str = "queue_wait_high";
    pub const QUEUE_WAIT_NORMAL: &str = "queue_wait_normal";
    pub const QUEUE_WAIT_LOW: &str = "queue_wait_low";
    pub const EXECUTE: &str = "t_execute";
    pub const TRANSLATE_DONE: &str = "t_translate_done";
}

/// Counts requests that actually reach the provider.
/// Persistence is debounced: a burst of increments results in one write.
pub struct RequestCounter {
    count: AtomicU64,
    save_pending: AtomicBool,
    store: Option<Arc<dyn PersistentStore>>,
    debounce: Duration,
}

impl RequestCounter {
    pub const STORE_KEY: &'static str = "request_count";

    /// `store` should be dedicated to the counter; sharing the cache's store
    /// would let cache eviction prune the count.
    pub fn new(store: Option<Arc<dyn PersistentStore>>, debounce: Duration) -> Self {
        Self {
            count: AtomicU64::new(0),
            save_pending: AtomicBool::new(false),
            store,
            debounce,
        }
    }

    /// Restore the persisted count, if any.
    pub async fn load(&self) {
        let Some(store) = &self.store else { return };
        match store.get(Self::STORE_KEY).await {
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(n) => self.count.store(n, Ordering::SeqCst),
                Err(e) => warn!(error = %e, "persisted request count unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "request count load failed"),
        }
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Increment and schedule a debounced save. Returns the new count.
    pub fn increment(self: &Arc<Self>) -> u64 {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.schedule_persist();
        n
    }

    fn schedule_persist(self: &Arc<Self>) {
        let Some(store) = self.store.clone() else { return };
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        // Detached: a failed save is logged and dropped.
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.save_pending.store(false, Ordering::SeqCst);
            let value = this.get().to_string();
            if let Err(e) = store.set(Self::STORE_KEY, &value).await {
                warn!(error = %e, "request count persist failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::store::MemoryStore;

    #[test]
    fn percentiles_over_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::EXECUTE, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::EXECUTE, 0.0), 1.0);
        assert_eq!(registry.percentile(metric_names::EXECUTE, 100.0), 100.0);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);

        let summary = registry.summary();
        assert_eq!(summary[metric_names::EXECUTE].count, 100);
    }

    #[test]
    fn ring_keeps_only_latest_samples() {
        let mut ring = SampleRing::new(4);
        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            ring.push(v);
        }
        assert_eq!(ring.count, 4);
        assert_eq!(ring.percentile(100.0), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_persists_once_per_burst() {
        let store = Arc::new(MemoryStore::new());
        let counter = Arc::new(RequestCounter::new(
            Some(store.clone() as Arc<dyn PersistentStore>),
            Duration::from_millis(800),
        ));

        for _ in 0..5 {
            counter.increment();
        }
        assert_eq!(store.get(RequestCounter::STORE_KEY).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(
            store.get(RequestCounter::STORE_KEY).await.unwrap().as_deref(),
            Some("5")
        );

        let restored = RequestCounter::new(Some(store as Arc<dyn PersistentStore>), Duration::ZERO);
        restored.load().await;
        assert_eq!(restored.get(), 5);
    }
}
