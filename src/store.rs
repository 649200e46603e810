use crate::cache::SeriesCache;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One durable row: the averaged value of `source` for the minute starting at
/// `timestamp`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredReading {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
}

/// Append-only reading store. Successful saves are mirrored into the
/// [`SeriesCache`]; the store stays the system of record.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    cache: Arc<SeriesCache>,
}

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

impl Store {
    pub async fn connect(
        database_url: &str,
        cache: Arc<SeriesCache>,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        // An in-memory database lives and dies with its connection.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool, cache);
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool, cache: Arc<SeriesCache>) -> Self {
        Self { pool, cache }
    }

    pub fn cache(&self) -> &Arc<SeriesCache> {
        &self.cache
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS readings_source_timestamp ON readings (source, timestamp)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS readings_timestamp ON readings (timestamp)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn insert(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
        value: Decimal,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO readings (source, timestamp, value) VALUES (?, ?, ?)")
            .bind(source)
            .bind(encode_timestamp(timestamp))
            .bind(value.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persists one point and mirrors it into the cache. A failure is logged
    /// and reported as `false`; the point is lost.
    pub async fn save(&self, source: &str, timestamp: DateTime<Utc>, value: Decimal) -> bool {
        match self.insert(source, timestamp, value).await {
            Ok(()) => {
                self.cache.add(source, timestamp, value);
                tracing::debug!(source, %timestamp, %value, "saved reading");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, source, %timestamp, %value, "failed to save reading");
                false
            }
        }
    }

    pub async fn try_query(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT source, timestamp, value
            FROM readings
            WHERE source = ? AND timestamp >= ?
            ORDER BY timestamp, id
            "#,
        )
        .bind(source)
        .bind(encode_timestamp(since))
        .fetch_all(&self.pool)
        .await?;

        let mut readings = Vec::with_capacity(rows.len());
        for (source, raw_ts, raw_value) in rows {
            let Some(timestamp) = decode_timestamp(&raw_ts) else {
                tracing::warn!(source = %source, timestamp = %raw_ts, "skipping row with bad timestamp");
                continue;
            };
            let Ok(value) = Decimal::from_str(&raw_value) else {
                tracing::warn!(source = %source, value = %raw_value, "skipping row with bad value");
                continue;
            };
            readings.push(StoredReading {
                source,
                timestamp,
                value,
            });
        }
        Ok(readings)
    }

    /// Rows for `source` at or after `since`, oldest first. Empty on failure.
    pub async fn query(&self, source: &str, since: DateTime<Utc>) -> Vec<StoredReading> {
        match self.try_query(source, since).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(error = %err, source, "failed to query readings");
                Vec::new()
            }
        }
    }

    pub async fn sources(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT source FROM readings ORDER BY source")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(source,)| source).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    Store::connect("sqlite::memory:", Arc::new(SeriesCache::new()))
        .await
        .expect("in-memory store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, DurationRound};
    use rust_decimal_macros::dec;

    fn minute_now() -> DateTime<Utc> {
        Utc::now().duration_trunc(ChronoDuration::minutes(1)).unwrap()
    }

    #[tokio::test]
    async fn query_filters_by_source_and_since_in_order() {
        let store = memory_store().await;
        let now = minute_now();
        store.insert("A", now - ChronoDuration::minutes(1), dec!(21.1)).await.unwrap();
        store.insert("A", now - ChronoDuration::minutes(3), dec!(20.9)).await.unwrap();
        store.insert("A", now - ChronoDuration::minutes(90), dec!(19.0)).await.unwrap();
        store.insert("B", now - ChronoDuration::minutes(2), dec!(5.5)).await.unwrap();

        let rows = store.query("A", now - ChronoDuration::minutes(60)).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, now - ChronoDuration::minutes(3));
        assert_eq!(rows[0].value, dec!(20.9));
        assert_eq!(rows[1].value, dec!(21.1));
        assert!(rows.iter().all(|r| r.source == "A"));
    }

    #[tokio::test]
    async fn values_round_trip_exactly() {
        let store = memory_store().await;
        let now = minute_now();
        store.insert("A", now, dec!(0.10)).await.unwrap();
        let rows = store.query("A", now).await;
        assert_eq!(rows[0].value.to_string(), "0.10");
    }

    #[tokio::test]
    async fn save_mirrors_into_cache() {
        let store = memory_store().await;
        let now = minute_now();
        assert!(store.save("A", now, dec!(21.10)).await);
        assert_eq!(store.cache().stats().get("A"), Some(&1));
        assert_eq!(store.query("A", now).await.len(), 1);
    }

    #[tokio::test]
    async fn save_failure_reports_false_and_skips_cache() {
        let store = memory_store().await;
        store.close().await;
        assert!(!store.save("A", minute_now(), dec!(21.0)).await);
        assert!(store.cache().stats().is_empty());
        assert!(store.query("A", minute_now()).await.is_empty());
    }

    #[tokio::test]
    async fn sources_lists_distinct_keys() {
        let store = memory_store().await;
        let now = minute_now();
        store.insert("b", now, dec!(1)).await.unwrap();
        store.insert("a", now, dec!(1)).await.unwrap();
        store.insert("a", now - ChronoDuration::minutes(1), dec!(1)).await.unwrap();
        assert_eq!(store.sources().await.unwrap(), vec!["a", "b"]);
    }
}
