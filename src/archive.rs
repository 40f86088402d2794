// =============================================================================
// Daily Archive — one UTC day of history per file
// =============================================================================
//
// Writes `<out_dir>/arbitrage_<YYYY-MM-DD>.jsonl` with every stored row whose
// `timestamp_utc` falls on the target day.  Numeric columns are normalised to
// JSON numbers (or null when they do not parse).  The file is written to a
// `.tmp` sibling first and renamed into place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use tracing::info;

use crate::storage::{coerce_f64, coerce_timestamp, JsonlHistoryStore};

const NUMERIC_COLUMNS: &[&str] = &[
    "expiry_ts",
    "days_to_expiry",
    "spot_price",
    "perp_price",
    "fut_price",
    "spread",
    "apy_annual",
    "z_hist",
    "z_cross",
    "z_term",
    "funding_est_hourly",
    "fee_bp_est",
    "apy_net",
    "liq_depth_bp",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveOutcome {
    pub path: PathBuf,
    pub rows: usize,
}

/// `ARB_ARCHIVE_DATE` when given, otherwise yesterday (UTC).
pub fn target_date(requested: Option<&str>, now: DateTime<Utc>) -> Result<NaiveDate> {
    match requested {
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid archive date {s:?}, expected YYYY-MM-DD")),
        None => Ok((now - Duration::days(1)).date_naive()),
    }
}

/// Stored rows of one UTC day, in stored order.  Rows without a usable
/// timestamp are skipped.
pub fn rows_for_date(values: Vec<Value>, date: NaiveDate) -> Vec<Value> {
    values
        .into_iter()
        .filter(|v| {
            v.get("timestamp_utc")
                .and_then(coerce_timestamp)
                .is_some_and(|ts| ts.date_naive() == date)
        })
        .map(normalise_numeric)
        .collect()
}

fn normalise_numeric(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        for col in NUMERIC_COLUMNS {
            if let Some(field) = obj.get_mut(*col) {
                *field = coerce_f64(field).map_or(Value::Null, Value::from);
            }
        }
    }
    value
}

pub fn archive_file_name(date: NaiveDate) -> String {
    format!("arbitrage_{}.jsonl", date.format("%Y-%m-%d"))
}

/// Archive one day.  `Ok(None)` when there is nothing stored for that day.
pub async fn archive_day(
    store: &JsonlHistoryStore,
    out_dir: &Path,
    date: NaiveDate,
) -> Result<Option<ArchiveOutcome>> {
    let values = store.read_all_values().await?;
    if values.is_empty() {
        info!(path = %store.path().display(), "history is empty, nothing to archive");
        return Ok(None);
    }

    let day = rows_for_date(values, date);
    if day.is_empty() {
        info!(%date, "no rows to archive");
        return Ok(None);
    }

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let mut content = String::new();
    for row in &day {
        content.push_str(&serde_json::to_string(row).context("failed to serialise archive row")?);
        content.push('\n');
    }

    let path = out_dir.join(archive_file_name(date));
    let tmp_path = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .with_context(|| format!("failed to rename archive to {}", path.display()))?;

    info!(path = %path.display(), rows = day.len(), %date, "daily archive written");
    Ok(Some(ArchiveOutcome {
        path,
        rows: day.len(),
    }))
}
