use crate::telemetry::Reading;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub const BUCKET_SECONDS: i64 = 60;
/// Averages are stored with two decimal places (banker's rounding).
pub const AVERAGE_DECIMAL_PLACES: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct FlushedPoint {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
    pub samples: usize,
}

/// Pending readings for the currently open minute, for every source.
#[derive(Debug, Default)]
pub(in crate::ingest) struct MinuteBuckets {
    open: Option<DateTime<Utc>>,
    pending: BTreeMap<String, Vec<Decimal>>,
}

impl MinuteBuckets {
    pub(in crate::ingest) fn new() -> Self {
        Self::default()
    }

    pub(in crate::ingest) fn open_bucket(&self) -> Option<DateTime<Utc>> {
        self.open
    }

    #[cfg(test)]
    pub(in crate::ingest) fn pending_sources(&self) -> usize {
        self.pending.len()
    }

    /// Adds one reading. When the reading belongs to a later minute than the
    /// open bucket, the open bucket is closed first and its averages returned.
    pub(in crate::ingest) fn add(&mut self, reading: &Reading) -> Vec<FlushedPoint> {
        let bucket = align_down(reading.timestamp, BUCKET_SECONDS);
        let mut flushed = Vec::new();

        match self.open {
            None => self.open = Some(bucket),
            Some(open) if bucket > open => {
                flushed = self.close();
                self.open = Some(bucket);
            }
            Some(open) if bucket < open => {
                tracing::debug!(
                    source = %reading.source,
                    timestamp = %reading.timestamp,
                    open = %open,
                    "late reading folded into open bucket"
                );
            }
            Some(_) => {}
        }

        self.pending
            .entry(reading.source.clone())
            .or_default()
            .push(reading.value);
        flushed
    }

    /// Closes the open bucket once `now` has moved past its minute, so a quiet
    /// spell does not hold the last minute back. The wall-clock minute becomes
    /// the new open bucket.
    pub(in crate::ingest) fn close_elapsed(&mut self, now: DateTime<Utc>) -> Vec<FlushedPoint> {
        let current = align_down(now, BUCKET_SECONDS);
        match self.open {
            Some(open) if open < current => {
                let flushed = self.close();
                self.open = Some(current);
                flushed
            }
            _ => Vec::new(),
        }
    }

    /// Closes the open bucket regardless of the clock. When anything was
    /// pending, the following minute becomes the open bucket, so readings that
    /// still arrive for the flushed minute fold forward instead of writing a
    /// second row for it.
    pub(in crate::ingest) fn flush(&mut self) -> Vec<FlushedPoint> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let flushed = self.close();
        self.open = self.open.map(|open| open + minutes(1));
        flushed
    }

    fn close(&mut self) -> Vec<FlushedPoint> {
        let Some(timestamp) = self.open else {
            self.pending.clear();
            return Vec::new();
        };
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(source, values)| {
                let Some(value) = mean(&values) else {
                    tracing::warn!(
                        source = %source,
                        timestamp = %timestamp,
                        samples = values.len(),
                        "minute average overflowed; bucket dropped"
                    );
                    return None;
                };
                Some(FlushedPoint {
                    source,
                    timestamp,
                    value,
                    samples: values.len(),
                })
            })
            .collect()
    }
}

/// Mean rounded half-even to two places. `None` for an empty slice or when
/// the sum overflows.
pub(crate) fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let total = values
        .iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(*value))?;
    let average = total.checked_div(Decimal::from(values.len()))?;
    Some(average.round_dp(AVERAGE_DECIMAL_PLACES))
}

pub(crate) fn align_down(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval_ms = interval_seconds.max(1) * 1000;
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(interval_ms) * interval_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

pub(crate) fn minute_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    align_down(ts, BUCKET_SECONDS)
}

pub(crate) fn minutes(count: i64) -> ChronoDuration {
    ChronoDuration::seconds(count * BUCKET_SECONDS)
}
