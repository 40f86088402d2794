// =============================================================================
// Shared types used across the basis radar
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contract family of a snapshot row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Perpetual,
    Future,
}

impl Default for InstrumentType {
    fn default() -> Self {
        Self::Future
    }
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Perpetual => write!(f, "perpetual"),
            Self::Future => write!(f, "future"),
        }
    }
}

/// Which leg to sell and which to buy, derived from the sign of the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideHint {
    #[serde(rename = "Short Future (rich) / Long Perp (cheap)")]
    ShortFutureLongPerp,
    #[serde(rename = "Long Future (cheap) / Short Perp (rich)")]
    LongFutureShortPerp,
}

impl SideHint {
    pub fn from_spread(spread: f64) -> Self {
        if spread > 0.0 {
            Self::ShortFutureLongPerp
        } else {
            Self::LongFutureShortPerp
        }
    }
}

impl std::fmt::Display for SideHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortFutureLongPerp => write!(f, "Short Future (rich) / Long Perp (cheap)"),
            Self::LongFutureShortPerp => write!(f, "Long Future (cheap) / Short Perp (rich)"),
        }
    }
}

/// A deviation metric that can trigger a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalMetric {
    #[serde(rename = "z_hist")]
    Historical,
    #[serde(rename = "z_cross")]
    CrossSectional,
    #[serde(rename = "z_term")]
    Term,
}

impl SignalMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Historical => "z_hist",
            Self::CrossSectional => "z_cross",
            Self::Term => "z_term",
        }
    }
}

impl std::fmt::Display for SignalMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instrument observation at one timestamp, as fetched from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshotRow {
    pub timestamp_utc: DateTime<Utc>,
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub instrument_type: InstrumentType,
    pub instrument: String,
    /// Expiry in milliseconds since the epoch.
    pub expiry_ts: i64,
    /// Whole days to expiry, never below 1.
    pub days_to_expiry: u32,
    pub spot_price: f64,
    pub perp_price: f64,
    pub fut_price: f64,
}

/// Outcome of running the signal thresholds over one enriched row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDecision {
    pub signal_flag: bool,
    /// Triggered metrics, always in historical / cross-sectional / term order.
    pub signal_reason: Vec<SignalMetric>,
    pub side_hint: SideHint,
    /// Order-book depth is not modelled; always `None`.
    pub liq_depth_bp: Option<f64>,
}

/// A snapshot row plus every derived metric for one run.
///
/// Rows are built once by the metrics computer and only ever replaced by a new
/// value (see [`EnrichedRow::annotate`]), never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRow {
    #[serde(flatten)]
    pub snapshot: PriceSnapshotRow,
    pub spread: f64,
    pub apy_annual: f64,
    pub z_hist: Option<f64>,
    pub z_cross: Option<f64>,
    pub z_term: Option<f64>,
    pub funding_est_hourly: f64,
    pub fee_bp_est: f64,
    pub apy_net: f64,
    #[serde(flatten)]
    pub signal: Option<SignalDecision>,
    #[serde(default)]
    pub run_id: String,
}

impl EnrichedRow {
    /// Attach the signal decision and the run identifier.
    pub fn annotate(self, decision: SignalDecision, run_id: &str) -> Self {
        Self {
            signal: Some(decision),
            run_id: run_id.to_string(),
            ..self
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signal.as_ref().is_some_and(|s| s.signal_flag)
    }
}
