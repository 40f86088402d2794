// =============================================================================
// Signals Module
// =============================================================================
//
// Threshold gating of enriched rows into signal decisions:
// - Deviation triggers on |z_hist|, |z_cross|, |z_term|
// - Net-APY floor
// - Side hint from the spread sign

pub mod decider;

pub use decider::SignalDecider;
