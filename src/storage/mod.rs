// =============================================================================
// History Storage — append-only log of enriched rows
// =============================================================================
//
// The metrics computer only ever reads a bounded tail of this log.  Rows come
// back as loosely-typed JSON (older rows may have been hand-edited or written
// by earlier versions), so every field the statistics need is coerced and any
// row that fails coercion is dropped, never patched with a default.  The
// timestamp and the stored z-scores are optional: a row missing them still
// feeds the statistics.

pub mod jsonl;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::types::EnrichedRow;

pub use jsonl::JsonlHistoryStore;

/// Read/append access to the persisted history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The most recent `limit` persisted rows, oldest first.
    async fn read_tail(&self, limit: usize) -> Result<HistoryWindow>;

    /// Append rows after everything already stored.
    async fn append(&self, rows: &[EnrichedRow]) -> Result<()>;
}

/// The fields of a persisted row that the statistics and dashboard consume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryRow {
    pub timestamp_utc: Option<DateTime<Utc>>,
    pub instrument: String,
    pub days_to_expiry: f64,
    pub spread: f64,
    pub apy_annual: f64,
    pub z_hist: Option<f64>,
    pub z_cross: Option<f64>,
    pub z_term: Option<f64>,
}

impl HistoryRow {
    /// Coerce a stored JSON object, or `None` if any required field is unusable.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let instrument = obj.get("instrument")?.as_str()?.trim();
        if instrument.is_empty() {
            return None;
        }

        let optional = |key: &str| obj.get(key).and_then(coerce_f64);

        Some(Self {
            timestamp_utc: obj.get("timestamp_utc").and_then(coerce_timestamp),
            instrument: instrument.to_string(),
            days_to_expiry: coerce_f64(obj.get("days_to_expiry")?)?,
            spread: coerce_f64(obj.get("spread")?)?,
            apy_annual: coerce_f64(obj.get("apy_annual")?)?,
            z_hist: optional("z_hist"),
            z_cross: optional("z_cross"),
            z_term: optional("z_term"),
        })
    }
}

/// A finite number, or a string that parses to one.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// An RFC 3339 string or integer milliseconds since the epoch.
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}

/// Bounded, time-ordered tail of persisted rows with coercible fields only.
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    rows: Vec<HistoryRow>,
    dropped: usize,
}

impl HistoryWindow {
    pub fn empty() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn from_rows(rows: Vec<HistoryRow>) -> Self {
        Self { rows, dropped: 0 }
    }

    /// Coerce raw stored values, dropping the ones that do not fit.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let mut rows = Vec::new();
        let mut dropped = 0;
        for value in values {
            match HistoryRow::from_value(&value) {
                Some(row) => rows.push(row),
                None => dropped += 1,
            }
        }
        Self { rows, dropped }
    }

    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows rejected during coercion.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Rows grouped by instrument, each group in stored order.
    pub fn by_instrument(&self) -> HashMap<&str, Vec<&HistoryRow>> {
        let mut groups: HashMap<&str, Vec<&HistoryRow>> = HashMap::new();
        for row in &self.rows {
            groups.entry(row.instrument.as_str()).or_default().push(row);
        }
        groups
    }
}
