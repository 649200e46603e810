use crate::config::SourceConfig;
use crate::ingest::bucket::{minute_floor, minutes};
use crate::legend::Legend;
use crate::store::{Store, StoredReading};
use crate::telemetry::in_range;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One slot per minute, oldest first. `None` marks a gap.
pub type Series = BTreeMap<DateTime<Utc>, Option<Decimal>>;

#[derive(Debug, Clone)]
pub struct SeriesSettings {
    /// Largest change allowed between consecutive accepted values.
    pub max_step: Decimal,
    /// Gaps of up to this many minutes are bridged by interpolation.
    pub max_gap_minutes: usize,
    pub window: ChronoDuration,
}

impl Default for SeriesSettings {
    fn default() -> Self {
        Self {
            max_step: Decimal::new(5, 1),
            max_gap_minutes: 10,
            window: ChronoDuration::hours(24),
        }
    }
}

/// Rebuilds display series from durable points and the live legend value.
#[derive(Debug, Clone)]
pub struct SeriesBuilder {
    store: Store,
    legend: Arc<Legend>,
    settings: SeriesSettings,
}

impl SeriesBuilder {
    pub fn new(store: Store, legend: Arc<Legend>) -> Self {
        Self::with_settings(store, legend, SeriesSettings::default())
    }

    pub fn with_settings(store: Store, legend: Arc<Legend>, settings: SeriesSettings) -> Self {
        Self {
            store,
            legend,
            settings,
        }
    }

    pub fn settings(&self) -> &SeriesSettings {
        &self.settings
    }

    pub async fn build_series(&self, source: &SourceConfig) -> Series {
        self.build_series_at(source, Utc::now()).await
    }

    pub async fn build_series_at(&self, source: &SourceConfig, now: DateTime<Utc>) -> Series {
        let until = minute_floor(now);
        let since = until - self.settings.window;
        let points = self
            .store
            .cache()
            .read_with_fallback_at(&self.store, &source.source, since, now)
            .await;
        let live = self.legend.value(&source.source).await;
        let series = reconstruct(&points, live, since, until, source, &self.settings);
        tracing::debug!(
            source = %source.source,
            points = points.len(),
            filled = series.values().filter(|v| v.is_some()).count(),
            "series rebuilt"
        );
        series
    }
}

/// Builds the minute grid `[since, until]` for one source.
///
/// Durable points are calibrated and step-clamped in time order, short gaps
/// are interpolated linearly, and a live value (already calibrated) extends
/// the series to the `until` slot. Points whose calibrated value is out of
/// reading range are skipped.
pub(crate) fn reconstruct(
    points: &[StoredReading],
    live: Option<Decimal>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    source: &SourceConfig,
    settings: &SeriesSettings,
) -> Series {
    let since = minute_floor(since);
    let until = minute_floor(until).max(since);
    let slot_count = (until - since).num_minutes() as usize + 1;
    let mut slots: Vec<Option<Decimal>> = vec![None; slot_count];

    let mut last_accepted: Option<Decimal> = None;
    for point in points {
        let Some(calibrated) = source.calibrate(point.value).filter(|value| in_range(*value)) else {
            tracing::warn!(
                source = %source.source,
                timestamp = %point.timestamp,
                value = %point.value,
                "stored point out of range; skipped"
            );
            continue;
        };
        let value = clamp_step(calibrated, last_accepted, settings.max_step);
        last_accepted = Some(value);

        let slot = minute_floor(point.timestamp);
        if slot < since || slot > until {
            continue;
        }
        slots[(slot - since).num_minutes() as usize] = Some(value);
    }

    interpolate_gaps(&mut slots, settings.max_gap_minutes);

    if let Some(live) = live {
        let live = clamp_step(live, last_accepted, settings.max_step);
        extend_to_live(&mut slots, live, settings.max_gap_minutes);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(offset, value)| (since + minutes(offset as i64), value))
        .collect()
}

pub(crate) fn clamp_step(value: Decimal, previous: Option<Decimal>, max_step: Decimal) -> Decimal {
    match previous {
        Some(previous) if value - previous > max_step => previous + max_step,
        Some(previous) if previous - value > max_step => previous - max_step,
        _ => value,
    }
}

fn interpolate_gaps(slots: &mut [Option<Decimal>], max_gap: usize) {
    let known: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|_| idx))
        .collect();

    for pair in known.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        let gap = end - start;
        if gap <= 1 || gap > max_gap {
            continue;
        }
        let (Some(from), Some(to)) = (slots[start], slots[end]) else {
            continue;
        };
        for idx in start + 1..end {
            slots[idx] = Some(lerp(from, to, idx - start, gap));
        }
    }
}

fn extend_to_live(slots: &mut [Option<Decimal>], live: Decimal, max_gap: usize) {
    let Some(current) = slots.len().checked_sub(1) else {
        return;
    };
    if let Some(last) = slots.iter().rposition(Option::is_some) {
        let gap = current - last;
        if gap > 1 && gap <= max_gap {
            if let Some(from) = slots[last] {
                for idx in last + 1..current {
                    slots[idx] = Some(lerp(from, live, idx - last, gap));
                }
            }
        }
    }
    slots[current] = Some(live);
}

fn lerp(from: Decimal, to: Decimal, step: usize, steps: usize) -> Decimal {
    from + (to - from) * Decimal::from(step) / Decimal::from(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn until() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
    }

    fn since() -> DateTime<Utc> {
        until() - ChronoDuration::hours(24)
    }

    fn ago(minutes: i64) -> DateTime<Utc> {
        until() - ChronoDuration::minutes(minutes)
    }

    fn point(minutes_ago: i64, value: Decimal) -> StoredReading {
        StoredReading {
            source: "home/a".to_string(),
            timestamp: ago(minutes_ago),
            value,
        }
    }

    fn source() -> SourceConfig {
        SourceConfig::new("home/a", "A")
    }

    fn build(points: &[StoredReading], live: Option<Decimal>) -> Series {
        reconstruct(points, live, since(), until(), &source(), &SeriesSettings::default())
    }

    fn filled(series: &Series) -> Vec<(DateTime<Utc>, Decimal)> {
        series
            .iter()
            .filter_map(|(ts, value)| value.map(|v| (*ts, v)))
            .collect()
    }

    #[test]
    fn grid_covers_the_full_day() {
        let series = build(&[], None);
        assert_eq!(series.len(), 1441);
        assert_eq!(series.keys().next(), Some(&since()));
        assert_eq!(series.keys().last(), Some(&until()));
        assert!(series.values().all(Option::is_none));
    }

    #[test]
    fn calibration_applies_to_durable_points() {
        let source = SourceConfig::new("home/a", "A").with_calibration(dec!(2), dec!(1));
        let series = reconstruct(
            &[point(30, dec!(10))],
            None,
            since(),
            until(),
            &source,
            &SeriesSettings::default(),
        );
        assert_eq!(series[&ago(30)], Some(dec!(21)));
    }

    #[test]
    fn spikes_are_clamped_relative_to_previous_accepted_value() {
        let points = [point(3, dec!(20.0)), point(2, dec!(25.0)), point(1, dec!(19.0))];
        let series = build(&points, None);
        assert_eq!(series[&ago(3)], Some(dec!(20.0)));
        assert_eq!(series[&ago(2)], Some(dec!(20.5)));
        assert_eq!(series[&ago(1)], Some(dec!(20.0)));
    }

    #[test]
    fn short_gaps_are_interpolated_and_long_gaps_stay_empty() {
        let points = [
            point(100, dec!(20.0)),
            point(96, dec!(20.4)),
            point(50, dec!(20.4)),
        ];
        let series = build(&points, None);
        assert_eq!(series[&ago(99)], Some(dec!(20.1)));
        assert_eq!(series[&ago(98)], Some(dec!(20.2)));
        assert_eq!(series[&ago(97)], Some(dec!(20.3)));
        assert_eq!(series[&ago(70)], None);
        assert_eq!(series[&ago(51)], None);
    }

    #[test]
    fn gap_of_exactly_max_is_bridged() {
        let series = build(&[point(30, dec!(20.0)), point(20, dec!(20.4))], None);
        assert_eq!(series[&ago(25)], Some(dec!(20.2)));

        let series = build(&[point(31, dec!(20.0)), point(20, dec!(20.4))], None);
        assert_eq!(series[&ago(25)], None);
    }

    #[test]
    fn live_value_fills_current_minute_without_backfill_after_long_gap() {
        let series = build(&[point(12, dec!(20.0))], Some(dec!(20.2)));
        assert_eq!(series[&until()], Some(dec!(20.2)));
        for minutes in 1..12 {
            assert_eq!(series[&ago(minutes)], None);
        }
        assert_eq!(series[&ago(12)], Some(dec!(20.0)));
    }

    #[test]
    fn live_value_backfills_short_gap() {
        let series = build(&[point(4, dec!(20.0))], Some(dec!(20.4)));
        assert_eq!(series[&ago(3)], Some(dec!(20.1)));
        assert_eq!(series[&ago(1)], Some(dec!(20.3)));
        assert_eq!(series[&until()], Some(dec!(20.4)));
    }

    #[test]
    fn live_value_is_clamped_against_last_durable_point() {
        let series = build(&[point(1, dec!(20.0))], Some(dec!(30.0)));
        assert_eq!(series[&until()], Some(dec!(20.5)));

        let series = build(&[], Some(dec!(30.0)));
        assert_eq!(filled(&series), vec![(until(), dec!(30.0))]);
    }

    #[test]
    fn adjacent_points_never_move_more_than_max_step() {
        let values = [
            dec!(20.0), dec!(23.7), dec!(18.1), dec!(18.3), dec!(40.0),
            dec!(-5.0), dec!(20.2), dec!(20.9), dec!(19.0), dec!(25.5),
        ];
        // Mix of adjacent minutes and bridgeable gaps.
        let offsets = [60, 59, 55, 54, 50, 41, 40, 39, 30, 29];
        let points: Vec<_> = offsets
            .iter()
            .zip(values)
            .map(|(offset, value)| point(*offset, value))
            .collect();

        let series = build(&points, None);
        let filled = filled(&series);
        assert!(filled.len() > points.len());
        for pair in filled.windows(2) {
            let step = (pair[1].1 - pair[0].1).abs();
            assert!(step <= dec!(0.5), "step {step} between {:?}", pair);
        }
    }

    #[test]
    fn out_of_window_points_still_anchor_the_clamp() {
        let points = [
            StoredReading {
                source: "home/a".to_string(),
                timestamp: since() - ChronoDuration::minutes(1),
                value: dec!(10.0),
            },
            point(1440, dec!(20.0)),
        ];
        let series = build(&points, None);
        assert_eq!(series[&since()], Some(dec!(10.5)));
    }

    #[test]
    fn out_of_range_points_are_skipped() {
        let points = [
            point(3, dec!(20.0)),
            point(2, Decimal::MAX),
            point(1, dec!(20.3)),
        ];
        let series = build(&points, None);
        assert_eq!(series[&ago(3)], Some(dec!(20.0)));
        assert_eq!(series[&ago(2)], Some(dec!(20.15)));
        assert_eq!(series[&ago(1)], Some(dec!(20.3)));
    }

    #[tokio::test]
    async fn builder_reads_store_and_legend() {
        let store = crate::store::memory_store().await;
        let config = SourceConfig::new("home/c", "C");
        let legend = Arc::new(Legend::new(vec![config.clone()]));
        let builder = SeriesBuilder::new(store.clone(), legend.clone());

        let now = Utc::now();
        let current = minute_floor(now);
        store
            .insert("home/c", current - ChronoDuration::minutes(12), dec!(20.0))
            .await
            .unwrap();
        legend.record("home/c", dec!(21.3), now).await;

        let series = builder.build_series_at(&config, now).await;
        assert_eq!(series.len(), 1441);
        assert_eq!(series[&current], Some(dec!(20.5)));
        for minutes in 1..12 {
            assert_eq!(series[&(current - ChronoDuration::minutes(minutes))], None);
        }
        assert_eq!(
            series[&(current - ChronoDuration::minutes(12))],
            Some(dec!(20.0))
        );
        assert_eq!(store.cache().stats().get("home/c"), Some(&1));
    }
}
