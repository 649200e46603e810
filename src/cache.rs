use crate::store::{Store, StoredReading};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

pub const RETENTION_HOURS: i64 = 24;
pub const COVERAGE_SLACK_MINUTES: i64 = 5;

type SourceSeries = BTreeMap<DateTime<Utc>, Decimal>;

/// In-memory shadow of the last 24h of durable points, keyed by source.
///
/// Every mutation happens under one lock and leaves each per-source series
/// sorted with unique timestamps (a later write for the same instant replaces
/// the earlier value).
#[derive(Debug)]
pub struct SeriesCache {
    entries: Mutex<HashMap<String, SourceSeries>>,
    retention: ChronoDuration,
    coverage_slack: ChronoDuration,
}

impl Default for SeriesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::with_window(
            ChronoDuration::hours(RETENTION_HOURS),
            ChronoDuration::minutes(COVERAGE_SLACK_MINUTES),
        )
    }

    pub fn with_window(retention: ChronoDuration, coverage_slack: ChronoDuration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
            coverage_slack,
        }
    }

    pub fn retention(&self) -> ChronoDuration {
        self.retention
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SourceSeries>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("series cache lock poisoned; discarding cached entries");
                let mut guard = poisoned.into_inner();
                guard.clear();
                self.entries.clear_poison();
                guard
            }
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    pub fn add(&self, source: &str, timestamp: DateTime<Utc>, value: Decimal) {
        self.add_at(source, timestamp, value, Utc::now());
    }

    pub fn add_at(&self, source: &str, timestamp: DateTime<Utc>, value: Decimal, now: DateTime<Utc>) {
        let mut entries = self.lock();
        entries
            .entry(source.to_string())
            .or_default()
            .insert(timestamp, value);
        let evicted = evict(&mut entries, self.cutoff(now));
        tracing::trace!(source, %timestamp, %value, evicted, "cached reading");
    }

    pub fn read(&self, source: &str, since: DateTime<Utc>) -> Vec<StoredReading> {
        self.read_at(source, since, Utc::now())
    }

    pub fn read_at(
        &self,
        source: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<StoredReading> {
        let lower = since.max(self.cutoff(now));
        let entries = self.lock();
        let Some(series) = entries.get(source) else {
            return Vec::new();
        };
        series
            .range(lower..)
            .map(|(timestamp, value)| StoredReading {
                source: source.to_string(),
                timestamp: *timestamp,
                value: *value,
            })
            .collect()
    }

    /// Serves `source` from memory when the cached series reaches back to
    /// within the coverage slack of `since`; otherwise reads the store,
    /// backfills the cache and returns the store's rows.
    pub async fn read_with_fallback(
        &self,
        store: &Store,
        source: &str,
        since: DateTime<Utc>,
    ) -> Vec<StoredReading> {
        self.read_with_fallback_at(store, source, since, Utc::now())
            .await
    }

    pub async fn read_with_fallback_at(
        &self,
        store: &Store,
        source: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<StoredReading> {
        let cached = self.read_at(source, since, now);
        if let Some(oldest) = cached.first() {
            if oldest.timestamp <= since + self.coverage_slack {
                tracing::debug!(source, count = cached.len(), "cache hit");
                return cached;
            }
        }

        tracing::debug!(source, %since, cached = cached.len(), "cache miss; reading store");
        let rows = match store.try_query(source, since).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, source, "store read failed; serving cached data");
                return cached;
            }
        };

        let cutoff = self.cutoff(now);
        let mut entries = self.lock();
        let series = entries.entry(source.to_string()).or_default();
        let mut backfilled = 0usize;
        for row in rows.iter().filter(|row| row.timestamp >= cutoff) {
            if series.insert(row.timestamp, row.value).is_none() {
                backfilled += 1;
            }
        }
        evict(&mut entries, cutoff);
        drop(entries);
        tracing::debug!(source, backfilled, rows = rows.len(), "backfilled cache from store");

        rows
    }

    /// Replaces the cache contents with the last retention window of every
    /// source the store knows about. Returns the number of loaded entries.
    pub async fn initialize_from_store(&self, store: &Store) -> usize {
        self.initialize_from_store_at(store, Utc::now()).await
    }

    pub async fn initialize_from_store_at(&self, store: &Store, now: DateTime<Utc>) -> usize {
        tracing::info!("initializing series cache from store");
        self.clear();

        let sources = match store.sources().await {
            Ok(sources) => sources,
            Err(err) => {
                tracing::error!(error = %err, "failed to list stored sources");
                return 0;
            }
        };

        let since = self.cutoff(now);
        let mut total = 0usize;
        for source in sources {
            let rows = match store.try_query(&source, since).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::error!(error = %err, source = %source, "failed to warm cache for source");
                    continue;
                }
            };
            let loaded = rows.len();
            {
                let mut entries = self.lock();
                let series = entries.entry(source.clone()).or_default();
                for row in rows {
                    series.insert(row.timestamp, row.value);
                }
            }
            total += loaded;
            tracing::debug!(source = %source, loaded, "warmed cache");
        }

        tracing::info!(total, "series cache initialized");
        total
    }

    pub fn stats(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .map(|(source, series)| (source.clone(), series.len()))
            .collect()
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let mut entries = self.lock();
        let evicted = evict(&mut entries, cutoff);
        let remaining: usize = entries.values().map(BTreeMap::len).sum();
        tracing::debug!(evicted, remaining, "cache cleanup completed");
        evicted
    }

    pub fn clear(&self) {
        self.lock().clear();
        tracing::info!("series cache cleared");
    }
}

fn evict(entries: &mut HashMap<String, SourceSeries>, cutoff: DateTime<Utc>) -> usize {
    let mut evicted = 0usize;
    for series in entries.values_mut() {
        let kept = series.split_off(&cutoff);
        evicted += series.len();
        *series = kept;
    }
    entries.retain(|_, series| !series.is_empty());
    evicted
}
