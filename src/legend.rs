use crate::config::SourceConfig;
use crate::telemetry::in_range;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Display values are shown with one decimal place.
pub const DISPLAY_DECIMAL_PLACES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Unknown,
    Live,
}

/// Last known display value of one source plus its presentation metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendEntry {
    pub source: String,
    pub label: String,
    pub value: Option<Decimal>,
    pub state: SourceState,
    pub last_updated: DateTime<Utc>,
    pub border_color: String,
    pub background_color: String,
}

impl LegendEntry {
    fn unknown(config: &SourceConfig, now: DateTime<Utc>) -> Self {
        Self {
            source: config.source.clone(),
            label: config.label.clone(),
            value: None,
            state: SourceState::Unknown,
            last_updated: now,
            border_color: config.border_color.clone(),
            background_color: config.background_color.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Legend {
    sources: Vec<SourceConfig>,
    entries: Mutex<HashMap<String, LegendEntry>>,
}

impl Legend {
    pub fn new(sources: Vec<SourceConfig>) -> Self {
        Self::new_at(sources, Utc::now())
    }

    pub fn new_at(sources: Vec<SourceConfig>, now: DateTime<Utc>) -> Self {
        let entries = sources
            .iter()
            .map(|config| (config.source.clone(), LegendEntry::unknown(config, now)))
            .collect();
        Self {
            sources,
            entries: Mutex::new(entries),
        }
    }

    /// Configured sources in configuration order.
    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn source(&self, key: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|config| config.source == key)
            .or_else(|| self.sources.iter().find(|config| config.label == key))
    }

    /// Records a raw reading. Returns the calibrated display value, or `None`
    /// when `source` is not configured or the calibrated value is out of range.
    pub async fn record(&self, source: &str, raw: Decimal, now: DateTime<Utc>) -> Option<Decimal> {
        let config = self.sources.iter().find(|config| config.source == source)?;
        let Some(calibrated) = config.calibrate(raw).filter(|value| in_range(*value)) else {
            tracing::warn!(source, %raw, "calibrated reading out of range; legend unchanged");
            return None;
        };
        let mut value = calibrated.round_dp(DISPLAY_DECIMAL_PLACES);
        value.rescale(DISPLAY_DECIMAL_PLACES);

        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(config.source.clone())
            .or_insert_with(|| LegendEntry::unknown(config, now));
        entry.value = Some(value);
        entry.state = SourceState::Live;
        entry.last_updated = now;
        tracing::trace!(source, %value, "legend updated");
        Some(value)
    }

    /// Returns every live source idle for at least `idle_timeout` to the
    /// unknown state. Returns the expired source keys.
    pub async fn expire_idle(&self, now: DateTime<Utc>, idle_timeout: ChronoDuration) -> Vec<String> {
        let mut expired = Vec::new();
        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            if entry.value.is_some() && now - entry.last_updated >= idle_timeout {
                entry.value = None;
                entry.state = SourceState::Unknown;
                entry.last_updated = now;
                expired.push(entry.source.clone());
            }
        }
        drop(entries);

        for source in &expired {
            tracing::info!(source = %source, "source idle; legend reset to unknown");
        }
        expired
    }

    pub async fn snapshot(&self) -> Vec<LegendEntry> {
        let entries = self.entries.lock().await;
        self.sources
            .iter()
            .filter_map(|config| entries.get(&config.source).cloned())
            .collect()
    }

    pub async fn value(&self, source: &str) -> Option<Decimal> {
        self.entries
            .lock()
            .await
            .get(source)
            .and_then(|entry| entry.value)
    }

    pub async fn values(&self) -> HashMap<String, Option<Decimal>> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(source, entry)| (source.clone(), entry.value))
            .collect()
    }
}
