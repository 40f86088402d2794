// =============================================================================
// Metrics Computer — raw fields, z-scores and term deviation per snapshot
// =============================================================================
//
// For every instrument of the current snapshot:
//
//   spread     = fut - spot
//   apy_annual = (spread / spot) * (365 / max(dte, 1))
//   apy_net    = apy_annual - (fee_bp / 10_000) * 365
//   z_cross    = apy_annual against the whole snapshot
//   z_hist     = apy_annual against the same instrument's last 1000 stored rows
//   z_term     = (spread - curve(dte)) normalised by the curve's own residuals
//                on the history it was fitted to
//
// The fee term charges the per-trade fee on every day of the year.  That is
// far heavier than one round trip and is kept as-is so stored apy_net values
// stay comparable across versions.
//
// History is only ever the previously written rows passed in; rows computed
// in this pass never feed their own statistics.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::runtime_config::RuntimeConfig;
use crate::stats::{self, CurveKind, TermCurve};
use crate::storage::{HistoryRow, HistoryWindow};
use crate::types::{EnrichedRow, PriceSnapshotRow};

/// Same-instrument rows considered for the historical z-score.
pub const HIST_TAIL_ROWS: usize = 1000;

/// Residual spread below this fraction of the largest history spread counts
/// as a perfect fit (no usable term normalisation).
const RESIDUAL_REL_TOLERANCE: f64 = 1e-9;

/// Enriched rows of one snapshot plus the curve variant used for `z_term`.
#[derive(Debug, Clone)]
pub struct EnrichedSnapshot {
    pub rows: Vec<EnrichedRow>,
    pub term_curve: Option<CurveKind>,
    /// Knots of the fitted curve as (days_to_expiry, spread).
    pub curve_knots: Vec<(f64, f64)>,
}

/// Turns a price snapshot and a history window into enriched rows.
#[derive(Debug, Clone)]
pub struct MetricsComputer {
    pub term_bins: Vec<f64>,
    pub min_history_rows: usize,
    pub fee_bp: f64,
    pub funding_hourly: f64,
    pub bandwidth_fraction: f64,
}

/// A fitted term curve together with its residual distribution.
struct TermNormaliser {
    curve: TermCurve,
    mean: f64,
    std: f64,
}

impl TermNormaliser {
    fn score(&self, spread: f64, dte: f64) -> Option<f64> {
        stats::zscore(spread - self.curve.predict(dte), self.mean, self.std)
    }
}

impl MetricsComputer {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            term_bins: cfg.term_curve_bins.clone(),
            min_history_rows: cfg.app.min_history_rows_per_expiry,
            fee_bp: cfg.app.fee_bp_est,
            funding_hourly: cfg.app.funding_est_hourly,
            bandwidth_fraction: cfg.app.curve_bandwidth_fraction,
        }
    }

    /// Enrich every row of `current` against `history`.
    pub fn compute(&self, current: &[PriceSnapshotRow], history: &HistoryWindow) -> EnrichedSnapshot {
        let by_instrument = history.by_instrument();
        let term = self.fit_term(history.rows());

        let raw: Vec<(f64, f64)> = current.iter().map(spread_and_apy).collect();
        let z_cross = stats::cross_sectional(&raw, |&(_, apy)| Some(apy), |_| ());

        let rows = current
            .iter()
            .zip(raw.iter())
            .zip(z_cross)
            .map(|((snap, &(spread, apy_annual)), z_cross)| {
                let z_hist = by_instrument
                    .get(snap.instrument.as_str())
                    .and_then(|rows| self.historical_z(apy_annual, rows));
                let z_term = term
                    .as_ref()
                    .and_then(|t| t.score(spread, clamped_dte(snap)));

                EnrichedRow {
                    snapshot: snap.clone(),
                    spread,
                    apy_annual,
                    z_hist,
                    z_cross,
                    z_term,
                    funding_est_hourly: self.funding_hourly,
                    fee_bp_est: self.fee_bp,
                    apy_net: net_apy(apy_annual, self.fee_bp),
                    signal: None,
                    run_id: String::new(),
                }
            })
            .collect();

        let (term_curve, curve_knots) = match &term {
            Some(t) => (Some(t.curve.kind()), t.curve.knots().collect()),
            None => (None, Vec::new()),
        };

        EnrichedSnapshot {
            rows,
            term_curve,
            curve_knots,
        }
    }

    /// z of `apy` against the most recent rows of one instrument, whatever
    /// their age.
    fn historical_z(&self, apy: f64, rows: &[&HistoryRow]) -> Option<f64> {
        let recent: Vec<f64> = rows[rows.len().saturating_sub(HIST_TAIL_ROWS)..]
            .iter()
            .map(|r| r.apy_annual)
            .collect();

        if recent.len() < self.min_history_rows {
            trace!(rows = recent.len(), min = self.min_history_rows, "historical z: insufficient rows");
            return None;
        }

        let (mean, std) = stats::population_stats(&recent)?;
        stats::zscore(apy, mean, std)
    }

    /// One curve over every history point, with its residual mean and std.
    fn fit_term(&self, history: &[HistoryRow]) -> Option<TermNormaliser> {
        if history.is_empty() {
            return None;
        }

        let x: Vec<f64> = history.iter().map(|r| r.days_to_expiry).collect();
        let y: Vec<f64> = history.iter().map(|r| r.spread).collect();

        let curve = stats::fit(&x, &y, self.bandwidth_fraction, &self.term_bins)?;

        let residuals: Vec<f64> = x
            .iter()
            .zip(y.iter())
            .map(|(&dte, &spread)| spread - curve.predict(dte))
            .collect();
        let (mean, std) = stats::population_stats(&residuals)?;

        let scale = y.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if !(std > scale * RESIDUAL_REL_TOLERANCE) {
            debug!(kind = %curve.kind(), std, "term residuals have no spread; z_term disabled");
            return None;
        }

        debug!(kind = %curve.kind(), points = x.len(), mean, std, "term normaliser ready");
        Some(TermNormaliser { curve, mean, std })
    }
}

fn clamped_dte(snap: &PriceSnapshotRow) -> f64 {
    snap.days_to_expiry.max(1) as f64
}

fn spread_and_apy(snap: &PriceSnapshotRow) -> (f64, f64) {
    let spread = snap.fut_price - snap.spot_price;
    let apy = (spread / snap.spot_price) * (365.0 / clamped_dte(snap));
    (spread, apy)
}

/// Gross APY minus the fee charged once per day for a year.
pub fn net_apy(apy_annual: f64, fee_bp: f64) -> f64 {
    apy_annual - (fee_bp / 10000.0) * 365.0
}

/// Distinct instruments in a set of rows, for logging and summaries.
pub fn instrument_count(rows: &[EnrichedRow]) -> usize {
    rows.iter()
        .map(|r| r.snapshot.instrument.as_str())
        .collect::<HashSet<_>>()
        .len()
}
