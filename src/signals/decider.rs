// =============================================================================
// Signal Decider — threshold gating of enriched rows
// =============================================================================
//
//   triggered(m)  = |z_m| > enter_m        (undefined z counts as 0 here only)
//   signal_flag   = any(triggered) && apy_net >= apy_net_min
//   signal_reason = every triggered metric, in z_hist / z_cross / z_term order
//   side_hint     = spread > 0 ? short future / long perp : long future / short perp

use crate::runtime_config::Thresholds;
use crate::types::{EnrichedRow, SideHint, SignalDecision, SignalMetric};

/// Applies entry thresholds to enriched rows.
#[derive(Debug, Clone, Copy)]
pub struct SignalDecider {
    thresholds: Thresholds,
}

impl SignalDecider {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn decide(&self, row: &EnrichedRow) -> SignalDecision {
        let t = &self.thresholds;
        let checks = [
            (SignalMetric::Historical, row.z_hist, t.z_hist_enter),
            (SignalMetric::CrossSectional, row.z_cross, t.z_cross_enter),
            (SignalMetric::Term, row.z_term, t.z_term_enter),
        ];

        let signal_reason: Vec<SignalMetric> = checks
            .iter()
            .filter(|(_, z, enter)| exceeds(*z, *enter))
            .map(|(metric, _, _)| *metric)
            .collect();

        let signal_flag = !signal_reason.is_empty() && row.apy_net >= t.apy_net_min;

        SignalDecision {
            signal_flag,
            signal_reason,
            side_hint: SideHint::from_spread(row.spread),
            liq_depth_bp: None,
        }
    }
}

/// The one place an undefined z-score is read as zero.
// Strict: a z exactly at the threshold does not trigger.
fn exceeds(z: Option<f64>, enter: f64) -> bool {
    z.unwrap_or(0.0).abs() > enter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentType, PriceSnapshotRow};
    use chrono::Utc;

    fn row(spread: f64, z: [Option<f64>; 3], apy_net: f64) -> EnrichedRow {
        EnrichedRow {
            snapshot: PriceSnapshotRow {
                timestamp_utc: Utc::now(),
                exchange: "deribit".into(),
                base: "BTC".into(),
                quote: "USD".into(),
                instrument_type: InstrumentType::Future,
                instrument: "BTC-28JUN24".into(),
                expiry_ts: 0,
                days_to_expiry: 90,
                spot_price: 60_000.0,
                perp_price: 60_000.0,
                fut_price: 60_000.0 + spread,
            },
            spread,
            apy_annual: apy_net,
            z_hist: z[0],
            z_cross: z[1],
            z_term: z[2],
            funding_est_hourly: 0.0,
            fee_bp_est: 0.0,
            apy_net,
            signal: None,
            run_id: String::new(),
        }
    }

    fn decider() -> SignalDecider {
        SignalDecider::new(Thresholds {
            z_hist_enter: 2.0,
            z_cross_enter: 1.5,
            z_term_enter: 2.0,
            apy_net_min: 0.05,
        })
    }

    #[test]
    fn side_hint_from_spread_sign() {
        let d = decider();
        assert_eq!(d.decide(&row(10.0, [None; 3], 0.1)).side_hint, SideHint::ShortFutureLongPerp);
        assert_eq!(d.decide(&row(-10.0, [None; 3], 0.1)).side_hint, SideHint::LongFutureShortPerp);
        assert_eq!(d.decide(&row(0.0, [None; 3], 0.1)).side_hint, SideHint::LongFutureShortPerp);
    }

    #[test]
    fn undefined_scores_never_trigger() {
        let d = SignalDecider::new(Thresholds {
            z_hist_enter: 0.0,
            z_cross_enter: 0.0,
            z_term_enter: 0.0,
            apy_net_min: f64::NEG_INFINITY,
        });
        let decision = d.decide(&row(10.0, [None; 3], 0.1));
        assert!(!decision.signal_flag);
        assert!(decision.signal_reason.is_empty());
        assert!(decision.liq_depth_bp.is_none());
    }

    #[test]
    fn any_trigger_with_enough_apy_signals() {
        let decision = decider().decide(&row(10.0, [None, Some(-1.6), None], 0.06));
        assert!(decision.signal_flag);
        assert_eq!(decision.signal_reason, vec![SignalMetric::CrossSectional]);
    }

    #[test]
    fn apy_floor_blocks_but_reasons_still_reported() {
        let decision = decider().decide(&row(10.0, [Some(3.0), Some(2.0), Some(-2.5)], 0.01));
        assert!(!decision.signal_flag);
        assert_eq!(
            decision.signal_reason,
            vec![SignalMetric::Historical, SignalMetric::CrossSectional, SignalMetric::Term]
        );
    }

    #[test]
    fn threshold_is_strict() {
        let decision = decider().decide(&row(10.0, [Some(2.0), None, None], 0.1));
        assert!(!decision.signal_flag);
    }

    #[test]
    fn apy_floor_is_inclusive() {
        let decision = decider().decide(&row(10.0, [None, None, Some(2.1)], 0.05));
        assert!(decision.signal_flag);
        assert_eq!(decision.signal_reason, vec![SignalMetric::Term]);
    }
}
