use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Largest reading magnitude accepted from a sensor.
pub const MAX_READING_MAGNITUDE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// A raw sensor reading as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
}

impl Reading {
    pub fn new(source: impl Into<String>, timestamp: DateTime<Utc>, value: Decimal) -> Self {
        Self {
            source: source.into(),
            timestamp,
            value,
        }
    }

    pub fn in_range(&self) -> bool {
        in_range(self.value)
    }
}

pub fn in_range(value: Decimal) -> bool {
    value.abs() <= MAX_READING_MAGNITUDE
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is empty")]
    Empty,
    #[error("payload is not utf-8")]
    NotUtf8,
    #[error("invalid decimal value {0:?}")]
    InvalidValue(String),
    #[error("reading {0} is out of range")]
    OutOfRange(Decimal),
    #[error("invalid json payload: {0}")]
    Json(#[from] simd_json::Error),
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(borrow)]
    value: BorrowedValue<'a>,
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedValue<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
}

impl BorrowedTimestamp<'_> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            BorrowedTimestamp::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, PayloadError> {
    let trimmed = raw.trim();
    let value = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| PayloadError::InvalidValue(trimmed.to_string()))?;
    checked_range(value)
}

fn checked_range(value: Decimal) -> Result<Decimal, PayloadError> {
    if in_range(value) {
        Ok(value)
    } else {
        Err(PayloadError::OutOfRange(value))
    }
}

/// Decodes a reading published on `topic`.
///
/// Sensors publish either a bare decimal (`21.37`) or a JSON object carrying a
/// `value` and optional `timestamp`. Without a usable timestamp the reading is
/// stamped with `received_at`.
pub fn parse_payload(
    topic: &str,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Reading, PayloadError> {
    let first = payload
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace())
        .ok_or(PayloadError::Empty)?;

    if first == b'{' {
        let parsed: BorrowedReading = simd_json::from_slice(payload)?;
        let value = match parsed.value {
            BorrowedValue::Str(s) => parse_decimal(s)?,
            BorrowedValue::Int(v) => checked_range(Decimal::from(v))?,
            BorrowedValue::Float(v) => parse_decimal(&v.to_string())?,
        };
        let timestamp = parsed
            .timestamp
            .as_ref()
            .and_then(BorrowedTimestamp::to_datetime)
            .unwrap_or(received_at);
        return Ok(Reading::new(topic, timestamp, value));
    }

    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    Ok(Reading::new(topic, received_at, parse_decimal(text)?))
}
