pub mod bucket;


use crate::broadcast::Broadcaster;
use crate::pipeline::IngestStats;
use crate::store::Store;
use crate::telemetry::Reading;
use bucket::{FlushedPoint, MinuteBuckets};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Folds raw readings into per-minute averages and persists each closed
/// minute. Owned by the pipeline worker, so it needs no locking of its own.
pub struct Aggregator {
    store: Store,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<IngestStats>,
    buckets: MinuteBuckets,
}

impl Aggregator {
    pub fn new(store: Store, broadcaster: Arc<Broadcaster>, stats: Arc<IngestStats>) -> Self {
        Self {
            store,
            broadcaster,
            stats,
            buckets: MinuteBuckets::new(),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn open_bucket(&self) -> Option<DateTime<Utc>> {
        self.buckets.open_bucket()
    }

    /// Handles one reading: updates the live legend, then adds it to the
    /// open minute, persisting the previous minute when this reading starts
    /// a new one.
    pub async fn ingest(&mut self, reading: Reading) -> usize {
        if !reading.in_range() {
            self.stats.rejected_readings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                source = %reading.source,
                value = %reading.value,
                "reading out of range; dropped"
            );
            return 0;
        }
        self.stats.accepted_readings.fetch_add(1, Ordering::Relaxed);
        self.broadcaster.observe(&reading).await;
        let flushed = self.buckets.add(&reading);
        self.persist(flushed).await
    }

    /// Persists the open minute once the wall clock has left it.
    pub async fn close_elapsed(&mut self, now: DateTime<Utc>) -> usize {
        let flushed = self.buckets.close_elapsed(now);
        self.persist(flushed).await
    }

    /// Persists whatever is pending regardless of the clock.
    pub async fn flush(&mut self) -> usize {
        let flushed = self.buckets.flush();
        self.persist(flushed).await
    }

    async fn persist(&self, points: Vec<FlushedPoint>) -> usize {
        if points.is_empty() {
            return 0;
        }

        let mut saved = 0usize;
        for point in &points {
            if self
                .store
                .save(&point.source, point.timestamp, point.value)
                .await
            {
                saved += 1;
                tracing::debug!(
                    source = %point.source,
                    timestamp = %point.timestamp,
                    value = %point.value,
                    samples = point.samples,
                    "stored minute average"
                );
            } else {
                self.stats.failed_points.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .record_error(format!("failed to store minute average for {}", point.source));
            }
        }

        self.stats
            .flushed_points
            .fetch_add(saved as u64, Ordering::Relaxed);
        self.stats
            .last_flush_unix_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        if saved == points.len() {
            self.stats.clear_error();
        }
        if saved > 0 {
            self.broadcaster.request_publish();
        }
        saved
    }
}
