// =============================================================================
// Statistics Module
// =============================================================================
//
// Pure, side-effect-free statistics used by the metrics computer.  Every
// public function returns `Option<T>` (or a vector of them) so callers are
// forced to handle insufficient-data and zero-variance cases explicitly instead
// of carrying NaN through the pipeline.

pub mod term_curve;
pub mod zscore;

pub use term_curve::{fit, CurveKind, TermCurve};
pub use zscore::{cross_sectional, rolling_by_group};

/// Relative tolerance below which a standard deviation counts as zero.
///
/// Identical inputs can produce a mean that differs from the inputs in the
/// last ulp, which would otherwise leave a ~1e-17 std and a z-score of +-1.
const STD_REL_TOLERANCE: f64 = 1e-12;

/// Population mean and standard deviation (divisor N) of `values`.
///
/// Returns `None` for an empty slice or when any value is non-finite.
pub fn population_stats(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

    Some((mean, variance.sqrt()))
}

/// `(value - mean) / std`, or `None` when `std` is zero within tolerance.
pub fn zscore(value: f64, mean: f64, std: f64) -> Option<f64> {
    if !(std > mean.abs() * STD_REL_TOLERANCE) {
        return None;
    }
    let z = (value - mean) / std;
    z.is_finite().then_some(z)
}
