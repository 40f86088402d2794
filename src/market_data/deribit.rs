// =============================================================================
// Deribit REST Client — spot proxy, perpetual and dated futures prices
// =============================================================================
//
// Deribit has no spot book, so the index price stands in for spot.  One run
// issues:
//   GET /public/get_index_price   (index_name = <base>_<quote>, lowercase)
//   GET /public/ticker            (<BASE>-PERPETUAL)
//   GET /public/get_instruments   (currency = <BASE>, kind = future)
//   GET /public/ticker            (once per other listed instrument)
//
// Ticker prices use `last_price`, falling back to `mark_price` when there has
// been no trade.  Any transport or API error fails the whole fetch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

use super::SnapshotSource;
use crate::types::{InstrumentType, PriceSnapshotRow};

const DERIBIT_API: &str = "https://www.deribit.com/api/v2";

/// A live contract listed by `get_instruments`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentInfo {
    pub name: String,
    pub expiration_ms: i64,
    pub kind: InstrumentType,
}

/// Public-endpoint Deribit client.
#[derive(Clone)]
pub struct DeribitClient {
    base_url: String,
    client: reqwest::Client,
}

impl DeribitClient {
    /// Create a new client with a 15 s request timeout.
    pub fn new() -> Self {
        Self::with_base_url(DERIBIT_API)
    }

    /// Create a client against a different API root (testnet, proxies).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client for DeribitClient"),
        }
    }

    async fn get(&self, method: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, method);

        let resp = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {method}"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {method} response body"))?;

        if !status.is_success() {
            anyhow::bail!("{} returned {}: {}", method, status, body);
        }
        if let Some(err) = body.get("error") {
            anyhow::bail!("{} returned error: {}", method, err);
        }

        body.get("result")
            .cloned()
            .with_context(|| format!("{method} response has no result"))
    }

    #[instrument(skip(self), name = "deribit::index_price")]
    pub async fn index_price(&self, base: &str, quote: &str) -> Result<f64> {
        let index_name = format!("{}_{}", base.to_lowercase(), quote.to_lowercase());
        let result = self
            .get("public/get_index_price", &[("index_name", index_name.as_str())])
            .await?;
        parse_index_price(&result)
    }

    #[instrument(skip(self), name = "deribit::ticker_price")]
    pub async fn ticker_price(&self, instrument: &str) -> Result<f64> {
        let result = self
            .get("public/ticker", &[("instrument_name", instrument)])
            .await?;
        parse_ticker_price(&result).with_context(|| format!("no usable price for {instrument}"))
    }

    #[instrument(skip(self), name = "deribit::futures")]
    pub async fn futures(&self, base: &str) -> Result<Vec<InstrumentInfo>> {
        let result = self
            .get(
                "public/get_instruments",
                &[("currency", base), ("kind", "future"), ("expired", "false")],
            )
            .await?;
        parse_instruments(&result)
    }
}

impl Default for DeribitClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSource for DeribitClient {
    async fn fetch(&self, base: &str, quote: &str) -> Result<Vec<PriceSnapshotRow>> {
        let base = base.to_uppercase();
        let quote = quote.to_uppercase();

        let perp_name = format!("{base}-PERPETUAL");
        let spot = self.index_price(&base, &quote).await?;
        let perp_price = self.ticker_price(&perp_name).await?;
        let instruments = self.futures(&base).await?;

        let mut priced = Vec::with_capacity(instruments.len());
        for info in instruments {
            // Already priced above; no second ticker call for the perpetual.
            let price = if info.name == perp_name {
                perp_price
            } else {
                self.ticker_price(&info.name).await?
            };
            priced.push((info, price));
        }

        let rows = snapshot_rows(&base, &quote, spot, perp_price, priced, Utc::now());
        debug!(base = %base, spot, perp_price, instruments = rows.len(), "deribit snapshot fetched");
        Ok(rows)
    }
}

// =============================================================================
// Response parsing
// =============================================================================

fn parse_index_price(result: &Value) -> Result<f64> {
    result["index_price"]
        .as_f64()
        .filter(|p| p.is_finite() && *p > 0.0)
        .context("index price missing or not positive")
}

/// `last_price` unless absent or zero, then `mark_price`.
fn parse_ticker_price(result: &Value) -> Result<f64> {
    let usable = |v: &Value| v.as_f64().filter(|p| p.is_finite() && *p != 0.0);
    usable(&result["last_price"])
        .or_else(|| usable(&result["mark_price"]))
        .context("ticker has neither last_price nor mark_price")
}

fn parse_instruments(result: &Value) -> Result<Vec<InstrumentInfo>> {
    let arr = result
        .as_array()
        .context("get_instruments result is not an array")?;

    arr.iter()
        .map(|it| {
            let name = it["instrument_name"]
                .as_str()
                .context("instrument without instrument_name")?
                .to_string();
            let expiration_ms = it["expiration_timestamp"]
                .as_i64()
                .with_context(|| format!("{name} has no expiration_timestamp"))?;
            let kind = if it["settlement_period"].as_str() == Some("perpetual") {
                InstrumentType::Perpetual
            } else {
                InstrumentType::Future
            };
            Ok(InstrumentInfo {
                name,
                expiration_ms,
                kind,
            })
        })
        .collect()
}

/// One row per listed instrument, perpetual included, all stamped `now`.
fn snapshot_rows(
    base: &str,
    quote: &str,
    spot: f64,
    perp_price: f64,
    priced: Vec<(InstrumentInfo, f64)>,
    now: DateTime<Utc>,
) -> Vec<PriceSnapshotRow> {
    priced
        .into_iter()
        .map(|(info, fut_price)| PriceSnapshotRow {
            timestamp_utc: now,
            exchange: "deribit".to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            instrument_type: info.kind,
            days_to_expiry: days_to_expiry(info.expiration_ms, now),
            instrument: info.name,
            expiry_ts: info.expiration_ms,
            spot_price: spot,
            perp_price,
            fut_price,
        })
        .collect()
}

/// Whole days until expiry, clamped to at least 1.
pub fn days_to_expiry(expiration_ms: i64, now: DateTime<Utc>) -> u32 {
    let Some(expiry) = Utc.timestamp_millis_opt(expiration_ms).single() else {
        return 1;
    };
    let days = (expiry - now).num_days();
    days.clamp(1, u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticker_prefers_last_price() {
        let t = json!({ "last_price": 61_000.5, "mark_price": 61_002.0 });
        assert!((parse_ticker_price(&t).unwrap() - 61_000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn ticker_falls_back_to_mark_price() {
        let t = json!({ "last_price": null, "mark_price": 61_002.0 });
        assert!((parse_ticker_price(&t).unwrap() - 61_002.0).abs() < f64::EPSILON);
        let t = json!({ "last_price": 0.0, "mark_price": 61_002.0 });
        assert!((parse_ticker_price(&t).unwrap() - 61_002.0).abs() < f64::EPSILON);
        assert!(parse_ticker_price(&json!({})).is_err());
    }

    #[test]
    fn index_price_must_be_positive() {
        assert!(parse_index_price(&json!({ "index_price": 60_000.0 })).is_ok());
        assert!(parse_index_price(&json!({ "index_price": 0.0 })).is_err());
        assert!(parse_index_price(&json!({})).is_err());
    }

    #[test]
    fn instruments_classify_perpetual() {
        let result = json!([
            { "instrument_name": "BTC-PERPETUAL", "expiration_timestamp": 32_503_708_800_000_i64, "settlement_period": "perpetual" },
            { "instrument_name": "BTC-28JUN24", "expiration_timestamp": 1_719_561_600_000_i64, "settlement_period": "month" }
        ]);
        let parsed = parse_instruments(&result).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].kind, InstrumentType::Perpetual);
        assert_eq!(parsed[1].kind, InstrumentType::Future);
        assert_eq!(parsed[1].name, "BTC-28JUN24");
    }

    #[test]
    fn instruments_reject_malformed() {
        assert!(parse_instruments(&json!({})).is_err());
        assert!(parse_instruments(&json!([{ "instrument_name": "X" }])).is_err());
    }

    #[test]
    fn dte_truncates_and_clamps() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let in_30_5_days = now + chrono::Duration::hours(30 * 24 + 12);
        assert_eq!(days_to_expiry(in_30_5_days.timestamp_millis(), now), 30);

        let in_6_hours = now + chrono::Duration::hours(6);
        assert_eq!(days_to_expiry(in_6_hours.timestamp_millis(), now), 1);

        let expired = now - chrono::Duration::days(2);
        assert_eq!(days_to_expiry(expired.timestamp_millis(), now), 1);
    }

    #[test]
    fn snapshot_keeps_the_perpetual_row() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let result = json!([
            { "instrument_name": "BTC-PERPETUAL", "expiration_timestamp": 32_503_708_800_000_i64, "settlement_period": "perpetual" },
            { "instrument_name": "BTC-29MAR24", "expiration_timestamp": 1_711_699_200_000_i64, "settlement_period": "month" }
        ]);
        let priced: Vec<(InstrumentInfo, f64)> = parse_instruments(&result)
            .unwrap()
            .into_iter()
            .zip([60_010.0, 60_400.0])
            .collect();

        let rows = snapshot_rows("BTC", "USD", 60_000.0, 60_010.0, priced, now);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instrument, "BTC-PERPETUAL");
        assert_eq!(rows[0].instrument_type, InstrumentType::Perpetual);
        assert_eq!(rows[0].fut_price, rows[0].perp_price);
        assert!(rows[0].days_to_expiry > 300_000);
        assert_eq!(rows[1].instrument_type, InstrumentType::Future);
        assert_eq!(rows[1].days_to_expiry, 28);
        assert!(rows.iter().all(|r| r.spot_price == 60_000.0 && r.timestamp_utc == now));
    }
}
