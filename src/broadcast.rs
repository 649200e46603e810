use crate::config::SourceConfig;
use crate::legend::{Legend, LegendEntry};
use crate::series::{Series, SeriesBuilder};
use crate::telemetry::Reading;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

/// Legend moves smaller than this only produce a light update.
pub const SIGNIFICANCE_THRESHOLD: Decimal = Decimal::from_parts(5, 0, 0, false, 2);
const SUBSCRIBER_BUFFER: usize = 16;
/// Interpolated chart values are trimmed to this many decimal places.
pub const CHART_DECIMAL_PLACES: u32 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct ChartDataset {
    pub source: String,
    pub label: String,
    pub data: Series,
    #[serde(rename = "borderColor")]
    pub border_color: String,
    #[serde(rename = "backgroundColor")]
    pub background_color: String,
    #[serde(rename = "borderJoinStyle")]
    pub border_join_style: &'static str,
}

impl ChartDataset {
    pub fn new(config: &SourceConfig, data: Series) -> Self {
        Self {
            source: config.source.clone(),
            label: config.label.clone(),
            data: data
                .into_iter()
                .map(|(ts, value)| (ts, value.map(|v| v.round_dp(CHART_DECIMAL_PLACES))))
                .collect(),
            border_color: config.border_color.clone(),
            background_color: config.background_color.clone(),
            border_join_style: "round",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Chart {
    pub datasets: Vec<ChartDataset>,
}

/// What subscribers receive. Light updates carry only the legend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Update {
    #[serde(rename = "legends")]
    Light { legends: Vec<LegendEntry> },
    #[serde(rename = "combined")]
    Full {
        legends: Vec<LegendEntry>,
        chart: Chart,
    },
}

impl Update {
    pub fn is_full(&self) -> bool {
        matches!(self, Update::Full { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    NoSubscribers,
    Light,
    Full,
}

/// A new subscriber's receiving end plus the full update it starts from.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub initial: Arc<Update>,
    pub updates: mpsc::Receiver<Arc<Update>>,
}

/// Owns the legend-driven push side: idle expiry, the significance check
/// against the last chart sent, and fan-out to subscribers.
#[derive(Debug)]
pub struct Broadcaster {
    legend: Arc<Legend>,
    series: SeriesBuilder,
    threshold: Decimal,
    send_timeout: Duration,
    last_chart: Mutex<HashMap<String, Option<Decimal>>>,
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<Update>>>>,
    publish_requested: Notify,
}

impl Broadcaster {
    pub fn new(legend: Arc<Legend>, series: SeriesBuilder, send_timeout: Duration) -> Self {
        Self {
            legend,
            series,
            threshold: SIGNIFICANCE_THRESHOLD,
            send_timeout,
            last_chart: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            publish_requested: Notify::new(),
        }
    }

    pub fn legend(&self) -> &Arc<Legend> {
        &self.legend
    }

    pub fn series(&self) -> &SeriesBuilder {
        &self.series
    }

    /// Feeds a raw reading into the legend and asks for a publish.
    pub async fn observe(&self, reading: &Reading) {
        if self
            .legend
            .record(&reading.source, reading.value, Utc::now())
            .await
            .is_some()
        {
            self.request_publish();
        } else {
            tracing::debug!(source = %reading.source, "reading for unconfigured source");
        }
    }

    /// Coalesces publish requests; the publisher task picks them up.
    pub fn request_publish(&self) {
        self.publish_requested.notify_one();
    }

    /// Expires idle sources and always schedules a publish afterwards.
    pub async fn sweep(&self, now: DateTime<Utc>, idle_timeout: ChronoDuration) -> Vec<String> {
        let expired = self.legend.expire_idle(now, idle_timeout).await;
        self.request_publish();
        expired
    }

    pub async fn build_chart(&self) -> Chart {
        let mut datasets = Vec::with_capacity(self.legend.sources().len());
        for config in self.legend.sources() {
            let data = self.series.build_series(config).await;
            datasets.push(ChartDataset::new(config, data));
        }
        Chart { datasets }
    }

    async fn full_update(&self) -> Update {
        let legends = self.legend.snapshot().await;
        let chart = self.build_chart().await;
        let mut last_chart = self.last_chart.lock().await;
        *last_chart = values_of(&legends);
        Update::Full { legends, chart }
    }

    /// Pushes one update to every subscriber: a full chart when some legend
    /// value moved significantly since the last chart, the legend otherwise.
    /// Subscribers that cannot take the update in time are dropped.
    pub async fn publish(&self) -> Published {
        let targets: Vec<(Uuid, mpsc::Sender<Arc<Update>>)> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return Published::NoSubscribers;
        }

        let legends = self.legend.snapshot().await;
        let rebuild = {
            let last_chart = self.last_chart.lock().await;
            significant_change(&values_of(&legends), &last_chart, self.threshold)
        };
        let update = if rebuild {
            self.full_update().await
        } else {
            Update::Light { legends }
        };
        let published = if update.is_full() {
            Published::Full
        } else {
            Published::Light
        };

        let update = Arc::new(update);
        let mut failed = Vec::new();
        for (id, tx) in targets {
            if let Err(err) = tx.send_timeout(update.clone(), self.send_timeout).await {
                tracing::warn!(subscriber = %id, error = %err, "dropping subscriber");
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            let mut subscribers = self.subscribers.lock().await;
            for id in &failed {
                subscribers.remove(id);
            }
        }

        tracing::debug!(?published, dropped = failed.len(), "published update");
        published
    }

    /// Registers a subscriber. Its first message is always a full update.
    pub async fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, updates) = mpsc::channel(SUBSCRIBER_BUFFER);
        let initial = Arc::new(self.full_update().await);
        let count = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.insert(id, tx);
            subscribers.len()
        };
        tracing::info!(subscriber = %id, count, "subscriber connected");
        Subscription {
            id,
            initial,
            updates,
        }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        let removed = self.subscribers.lock().await.remove(&id).is_some();
        if removed {
            tracing::info!(subscriber = %id, "subscriber disconnected");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Drops every subscriber sender so their receivers see the end of the
    /// stream.
    pub async fn close_all(&self) {
        let closed = {
            let mut subscribers = self.subscribers.lock().await;
            let closed = subscribers.len();
            subscribers.clear();
            closed
        };
        tracing::info!(closed, "closed all subscribers");
    }

    /// Publishes whenever a publish was requested. Runs until aborted.
    pub async fn run_publisher(self: Arc<Self>) {
        loop {
            self.publish_requested.notified().await;
            self.publish().await;
        }
    }
}

fn values_of(legends: &[LegendEntry]) -> HashMap<String, Option<Decimal>> {
    legends
        .iter()
        .map(|entry| (entry.source.clone(), entry.value))
        .collect()
}

/// True when any source gained a value, lost it, or moved by more than
/// `threshold` since the last full update.
pub(crate) fn significant_change(
    current: &HashMap<String, Option<Decimal>>,
    last: &HashMap<String, Option<Decimal>>,
    threshold: Decimal,
) -> bool {
    current.iter().any(|(source, value)| {
        let previous = last.get(source).copied().flatten();
        match (value, previous) {
            (Some(value), Some(previous)) => (*value - previous).abs() > threshold,
            (Some(_), None) | (None, Some(_)) => true,
            (None, None) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_store;
    use rust_decimal_macros::dec;

    async fn broadcaster(send_timeout: Duration) -> Broadcaster {
        let store = memory_store().await;
        let legend = Arc::new(Legend::new(vec![
            SourceConfig::new("home/d", "D"),
            SourceConfig::new("home/e", "E"),
        ]));
        let series = SeriesBuilder::new(store, legend.clone());
        Broadcaster::new(legend, series, send_timeout)
    }

    fn values(pairs: &[(&str, Option<Decimal>)]) -> HashMap<String, Option<Decimal>> {
        pairs
            .iter()
            .map(|(source, value)| (source.to_string(), *value))
            .collect()
    }

    #[test]
    fn threshold_is_five_hundredths() {
        assert_eq!(SIGNIFICANCE_THRESHOLD, dec!(0.05));
    }

    #[test]
    fn significance_rules() {
        let last = values(&[("a", Some(dec!(21.0))), ("b", None)]);
        let same = values(&[("a", Some(dec!(21.0))), ("b", None)]);
        assert!(!significant_change(&same, &last, SIGNIFICANCE_THRESHOLD));

        let small = values(&[("a", Some(dec!(21.04))), ("b", None)]);
        assert!(!significant_change(&small, &last, SIGNIFICANCE_THRESHOLD));

        let moved = values(&[("a", Some(dec!(21.1))), ("b", None)]);
        assert!(significant_change(&moved, &last, SIGNIFICANCE_THRESHOLD));

        let appeared = values(&[("a", Some(dec!(21.0))), ("b", Some(dec!(3.0)))]);
        assert!(significant_change(&appeared, &last, SIGNIFICANCE_THRESHOLD));

        let lost = values(&[("a", None), ("b", None)]);
        assert!(significant_change(&lost, &last, SIGNIFICANCE_THRESHOLD));

        let first = values(&[("a", Some(dec!(21.0)))]);
        assert!(significant_change(&first, &HashMap::new(), SIGNIFICANCE_THRESHOLD));
    }

    #[tokio::test]
    async fn subscribe_starts_with_full_update() {
        let broadcaster = broadcaster(Duration::from_millis(200)).await;
        let subscription = broadcaster.subscribe().await;
        match subscription.initial.as_ref() {
            Update::Full { legends, chart } => {
                assert_eq!(legends.len(), 2);
                assert_eq!(chart.datasets.len(), 2);
                assert_eq!(chart.datasets[0].data.len(), 1441);
            }
            other => panic!("expected full update, got {other:?}"),
        }
        assert_eq!(broadcaster.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn stable_legend_publishes_light_updates() {
        let broadcaster = broadcaster(Duration::from_millis(200)).await;
        let now = Utc::now();
        broadcaster.legend().record("home/d", dec!(21.0), now).await;
        let mut subscription = broadcaster.subscribe().await;

        for raw in [dec!(21.0), dec!(21.04), dec!(20.96)] {
            broadcaster.legend().record("home/d", raw, Utc::now()).await;
            assert_eq!(broadcaster.publish().await, Published::Light);
        }

        for _ in 0..3 {
            let update = subscription.updates.recv().await.unwrap();
            assert!(matches!(update.as_ref(), Update::Light { .. }));
        }
    }

    #[tokio::test]
    async fn significant_move_publishes_full_update_once() {
        let broadcaster = broadcaster(Duration::from_millis(200)).await;
        let mut subscription = broadcaster.subscribe().await;

        broadcaster.legend().record("home/e", dec!(4.2), Utc::now()).await;
        assert_eq!(broadcaster.publish().await, Published::Full);
        assert_eq!(broadcaster.publish().await, Published::Light);

        let first = subscription.updates.recv().await.unwrap();
        assert!(first.is_full());
        let second = subscription.updates.recv().await.unwrap();
        assert!(!second.is_full());
    }

    #[tokio::test]
    async fn sweep_expiry_forces_full_update() {
        let broadcaster = broadcaster(Duration::from_millis(200)).await;
        let start = Utc::now();
        broadcaster.legend().record("home/d", dec!(21.0), start).await;
        let _subscription = broadcaster.subscribe().await;

        let later = start + ChronoDuration::minutes(6);
        let expired = broadcaster.sweep(later, ChronoDuration::minutes(5)).await;
        assert_eq!(expired, vec!["home/d"]);
        assert_eq!(broadcaster.publish().await, Published::Full);
    }

    #[tokio::test]
    async fn stalled_subscribers_are_dropped() {
        let broadcaster = broadcaster(Duration::from_millis(20)).await;
        let _stalled = broadcaster.subscribe().await;
        for _ in 0..SUBSCRIBER_BUFFER {
            broadcaster.publish().await;
        }
        assert_eq!(broadcaster.subscriber_count().await, 1);

        broadcaster.publish().await;
        assert_eq!(broadcaster.subscriber_count().await, 0);
        assert_eq!(broadcaster.publish().await, Published::NoSubscribers);
    }

    #[tokio::test]
    async fn closed_receivers_are_dropped_and_close_all_ends_streams() {
        let broadcaster = broadcaster(Duration::from_millis(200)).await;
        let gone = broadcaster.subscribe().await;
        drop(gone);
        broadcaster.publish().await;
        assert_eq!(broadcaster.subscriber_count().await, 0);

        let mut open = broadcaster.subscribe().await;
        broadcaster.close_all().await;
        assert!(open.updates.recv().await.is_none());
    }

    #[test]
    fn updates_serialize_with_type_tag() {
        let light = Update::Light {
            legends: Vec::new(),
        };
        let json = serde_json::to_value(&light).unwrap();
        assert_eq!(json["type"], "legends");

        let full = Update::Full {
            legends: Vec::new(),
            chart: Chart {
                datasets: Vec::new(),
            },
        };
        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(json["type"], "combined");
        assert!(json["chart"]["datasets"].is_array());
    }
}
