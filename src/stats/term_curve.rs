// =============================================================================
// Term Curve — expected spread as a function of days-to-expiry
// =============================================================================
//
// Two fitting strategies over historical (DTE, spread) pairs:
//
//   Primary   LOWESS: for every x_i, a weighted linear regression over the
//             floor(frac * n) nearest neighbours (at least 2) with tricube weights
//             (1 - (d / d_max)^3)^3.  Three robustness passes re-weight each
//             point by the bisquare of its residual / (6 * median |residual|).
//
//   Fallback  Binned means: x is bucketed into ordered edges (first bucket
//             closed on both sides, the rest left-open), y is averaged per
//             bucket and each mean is pinned at its bucket's upper edge, with
//             the first mean repeated at the lower boundary.
//
// Both produce a `TermCurve`: knots joined linearly, flat beyond either end.
// The fallback is only consulted when the primary fit yields nothing.

use serde::Serialize;
use tracing::{debug, trace};

/// Fewest finite pairs the LOWESS fit accepts.
const MIN_PRIMARY_POINTS: usize = 5;

/// Robustifying passes after the initial LOWESS fit.
const ROBUSTNESS_ITERATIONS: usize = 3;

/// Which strategy produced a curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveKind {
    Lowess,
    Binned,
}

impl std::fmt::Display for CurveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lowess => write!(f, "lowess"),
            Self::Binned => write!(f, "binned"),
        }
    }
}

/// Piecewise-linear mapping from days-to-expiry to expected spread.
#[derive(Debug, Clone)]
pub struct TermCurve {
    xs: Vec<f64>,
    ys: Vec<f64>,
    kind: CurveKind,
}

impl TermCurve {
    fn from_knots(xs: Vec<f64>, ys: Vec<f64>, kind: CurveKind) -> Option<Self> {
        if xs.is_empty() || xs.len() != ys.len() {
            return None;
        }
        if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self { xs, ys, kind })
    }

    pub fn kind(&self) -> CurveKind {
        self.kind
    }

    /// Knot pairs in ascending x.
    pub fn knots(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }

    /// Expected spread at `dte`.
    pub fn predict(&self, dte: f64) -> f64 {
        let n = self.xs.len();
        if dte.is_nan() {
            return f64::NAN;
        }
        if dte <= self.xs[0] {
            return self.ys[0];
        }
        if dte >= self.xs[n - 1] {
            return self.ys[n - 1];
        }

        // xs[hi - 1] <= dte < xs[hi], with 1 <= hi <= n - 1.
        let hi = self.xs.partition_point(|&k| k <= dte);
        let lo = hi - 1;
        let (x0, x1) = (self.xs[lo], self.xs[hi]);
        let (y0, y1) = (self.ys[lo], self.ys[hi]);
        if x1 == x0 {
            return y1;
        }
        y0 + (y1 - y0) * (dte - x0) / (x1 - x0)
    }
}

/// Fit the primary curve, falling back to binned means when it yields nothing.
pub fn fit(x: &[f64], y: &[f64], frac: f64, bin_edges: &[f64]) -> Option<TermCurve> {
    if let Some(curve) = fit_primary(x, y, frac) {
        debug!(knots = curve.xs.len(), "term curve fitted (lowess)");
        return Some(curve);
    }

    let fallback = fit_fallback(x, y, bin_edges);
    match &fallback {
        Some(curve) => debug!(knots = curve.xs.len(), "term curve fitted (binned fallback)"),
        None => debug!(points = x.len(), "term curve unavailable"),
    }
    fallback
}

/// LOWESS fit over finite `(x, y)` pairs.
///
/// Returns `None` when fewer than five usable pairs remain, `frac` is outside
/// `(0, 1]`, or the smoother produces a non-finite value.
pub fn fit_primary(x: &[f64], y: &[f64], frac: f64) -> Option<TermCurve> {
    let mut pairs = finite_pairs(x, y);
    if pairs.len() < MIN_PRIMARY_POINTS {
        trace!(len = pairs.len(), min = MIN_PRIMARY_POINTS, "lowess: insufficient data");
        return None;
    }
    if !(frac > 0.0 && frac <= 1.0) {
        trace!(frac, "lowess: bandwidth fraction out of range");
        return None;
    }

    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();

    let fitted = lowess(&xs, &ys, frac, ROBUSTNESS_ITERATIONS)?;
    TermCurve::from_knots(xs, fitted, CurveKind::Lowess)
}

/// Binned-mean fit over finite `(x, y)` pairs.
///
/// Returns `None` when the edges are not at least two strictly increasing
/// finite values, or when no pair lands inside them.  Empty buckets
/// contribute no knot.
pub fn fit_fallback(x: &[f64], y: &[f64], bin_edges: &[f64]) -> Option<TermCurve> {
    if bin_edges.len() < 2
        || bin_edges.iter().any(|e| !e.is_finite())
        || bin_edges.windows(2).any(|w| w[1] <= w[0])
    {
        trace!(edges = ?bin_edges, "binned fit: invalid bin edges");
        return None;
    }

    let buckets = bin_edges.len() - 1;
    let mut sums = vec![0.0_f64; buckets];
    let mut counts = vec![0_usize; buckets];

    for (px, py) in finite_pairs(x, y) {
        if let Some(b) = bucket_of(px, bin_edges) {
            sums[b] += py;
            counts[b] += 1;
        }
    }

    let populated: Vec<usize> = (0..buckets).filter(|&b| counts[b] > 0).collect();
    let first = *populated.first()?;

    let mut xs = Vec::with_capacity(populated.len() + 1);
    let mut ys = Vec::with_capacity(populated.len() + 1);
    xs.push(bin_edges[first]);
    ys.push(sums[first] / counts[first] as f64);
    for &b in &populated {
        xs.push(bin_edges[b + 1]);
        ys.push(sums[b] / counts[b] as f64);
    }

    TermCurve::from_knots(xs, ys, CurveKind::Binned)
}

fn finite_pairs(x: &[f64], y: &[f64]) -> Vec<(f64, f64)> {
    x.iter()
        .copied()
        .zip(y.iter().copied())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .collect()
}

/// Bucket index of `x`: `[e0, e1]` for the first bucket, `(e_i, e_i+1]` after.
fn bucket_of(x: f64, edges: &[f64]) -> Option<usize> {
    let last = edges[edges.len() - 1];
    if x < edges[0] || x > last {
        return None;
    }
    if x == edges[0] {
        return Some(0);
    }
    Some(edges.partition_point(|&e| e < x) - 1)
}

/// Robust locally weighted linear regression on x-sorted data.
fn lowess(x: &[f64], y: &[f64], frac: f64, iterations: usize) -> Option<Vec<f64>> {
    let n = x.len();
    let k = ((frac * n as f64 + 1e-10) as usize).clamp(2, n);
    let y_magnitude = y.iter().fold(0.0_f64, |m, v| m.max(v.abs()));

    let mut robustness = vec![1.0_f64; n];
    let mut fitted = vec![0.0_f64; n];

    for pass in 0..=iterations {
        let mut left = 0;
        for i in 0..n {
            // Slide the k-point window while it gets closer to x[i].
            while left + k < n && x[i] - x[left] > x[left + k] - x[i] {
                left += 1;
            }
            let right = left + k;
            fitted[i] = local_linear(x, y, &robustness, left, right, i);
        }

        if pass == iterations {
            break;
        }

        let mut abs_resid: Vec<f64> = y
            .iter()
            .zip(fitted.iter())
            .map(|(yi, fi)| (yi - fi).abs())
            .collect();
        let scale = median(&mut abs_resid)? * 6.0;
        if !(scale > y_magnitude * 1e-12) {
            // Residuals are (mostly) exactly zero; further passes change nothing.
            break;
        }

        for j in 0..n {
            let u = (y[j] - fitted[j]) / scale;
            robustness[j] = if u.abs() < 1.0 {
                (1.0 - u * u).powi(2)
            } else {
                0.0
            };
        }
    }

    fitted.iter().all(|v| v.is_finite()).then_some(fitted)
}

/// Weighted linear fit over `x[left..right]` evaluated at `x[i]`.
fn local_linear(x: &[f64], y: &[f64], robustness: &[f64], left: usize, right: usize, i: usize) -> f64 {
    let xi = x[i];
    let radius = (xi - x[left]).max(x[right - 1] - xi);

    let mut weights = Vec::with_capacity(right - left);
    for j in left..right {
        let tricube = if radius > 0.0 {
            let u = (x[j] - xi).abs() / radius;
            if u < 1.0 {
                (1.0 - u.powi(3)).powi(3)
            } else {
                0.0
            }
        } else {
            1.0
        };
        weights.push(tricube * robustness[j]);
    }

    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        return y[i];
    }

    let xs = &x[left..right];
    let ys = &y[left..right];
    let x_mean = weights.iter().zip(xs).map(|(w, v)| w * v).sum::<f64>() / total;
    let y_mean = weights.iter().zip(ys).map(|(w, v)| w * v).sum::<f64>() / total;
    let var_x = weights
        .iter()
        .zip(xs)
        .map(|(w, v)| w * (v - x_mean).powi(2))
        .sum::<f64>()
        / total;

    // Degenerate spread in x: the local fit collapses to a weighted mean.
    if var_x.sqrt() <= 0.001 * (x[right - 1] - x[left]) || var_x <= 0.0 {
        return y_mean;
    }

    let cov_xy = weights
        .iter()
        .zip(xs.iter().zip(ys))
        .map(|(w, (vx, vy))| w * (vx - x_mean) * (vy - y_mean))
        .sum::<f64>()
        / total;

    y_mean + (cov_xy / var_x) * (xi - x_mean)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() || values.iter().any(|v| v.is_nan()) {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_requires_five_points() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 2.0, 3.0, 4.0];
        assert!(fit_primary(&x, &y, 0.6).is_none());
    }

    #[test]
    fn primary_ignores_non_finite_pairs_when_counting() {
        let x = [1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0];
        let y = [1.0, 2.0, 3.0, 4.0, 5.0, f64::NAN];
        assert!(fit_primary(&x, &y, 0.6).is_none());
    }

    #[test]
    fn primary_reproduces_a_line() {
        let x: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let curve = fit_primary(&x, &y, 0.6).unwrap();
        assert_eq!(curve.kind(), CurveKind::Lowess);
        assert!((curve.predict(10.5) - 22.0).abs() < 1e-9);
    }

    #[test]
    fn primary_sorts_unsorted_input() {
        let x = [5.0, 1.0, 4.0, 2.0, 3.0, 6.0];
        let y = [50.0, 10.0, 40.0, 20.0, 30.0, 60.0];
        let curve = fit_primary(&x, &y, 0.8).unwrap();
        assert!((curve.predict(3.5) - 35.0).abs() < 1e-9);
    }

    #[test]
    fn primary_downweights_outlier() {
        let x: Vec<f64> = (1..=30).map(|v| v as f64).collect();
        let mut y = x.clone();
        y[9] = 100.0;
        let curve = fit_primary(&x, &y, 0.6).unwrap();
        assert!((curve.predict(10.0) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn predict_extrapolates_flat() {
        let x: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v * 3.0).collect();
        let curve = fit_primary(&x, &y, 0.6).unwrap();
        assert!((curve.predict(-100.0) - 3.0).abs() < 1e-9);
        assert!((curve.predict(1_000.0) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_bins_and_interpolates() {
        let edges = [0.0, 7.0, 30.0, 90.0];
        let x = [3.0, 5.0, 20.0];
        let y = [10.0, 20.0, 40.0];
        let curve = fit_fallback(&x, &y, &edges).unwrap();
        assert_eq!(curve.kind(), CurveKind::Binned);

        let knots: Vec<(f64, f64)> = curve.knots().collect();
        assert_eq!(knots, vec![(0.0, 15.0), (7.0, 15.0), (30.0, 40.0)]);

        assert!((curve.predict(0.0) - 15.0).abs() < 1e-12);
        assert!((curve.predict(18.5) - 27.5).abs() < 1e-12);
        assert!((curve.predict(100.0) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn fallback_bucket_boundaries() {
        let edges = [0.0, 7.0, 30.0];
        assert_eq!(bucket_of(0.0, &edges), Some(0));
        assert_eq!(bucket_of(7.0, &edges), Some(0));
        assert_eq!(bucket_of(7.5, &edges), Some(1));
        assert_eq!(bucket_of(30.0, &edges), Some(1));
        assert_eq!(bucket_of(30.5, &edges), None);
        assert_eq!(bucket_of(-1.0, &edges), None);
    }

    #[test]
    fn fallback_rejects_bad_edges_and_empty_data() {
        assert!(fit_fallback(&[1.0], &[1.0], &[0.0]).is_none());
        assert!(fit_fallback(&[1.0], &[1.0], &[0.0, 7.0, 7.0]).is_none());
        assert!(fit_fallback(&[100.0], &[1.0], &[0.0, 7.0]).is_none());
        assert!(fit_fallback(&[], &[], &[0.0, 7.0]).is_none());
    }

    #[test]
    fn fit_uses_fallback_only_when_primary_fails() {
        let edges = [0.0, 30.0, 90.0];
        let x = [10.0, 20.0, 60.0];
        let y = [100.0, 200.0, 600.0];
        let curve = fit(&x, &y, 0.6, &edges).unwrap();
        assert_eq!(curve.kind(), CurveKind::Binned);

        let x: Vec<f64> = (1..=8).map(|v| v as f64 * 10.0).collect();
        let y: Vec<f64> = x.iter().map(|v| v * 10.0).collect();
        let curve = fit(&x, &y, 0.6, &edges).unwrap();
        assert_eq!(curve.kind(), CurveKind::Lowess);
    }

    #[test]
    fn fit_falls_back_when_smoother_overflows() {
        // Weighted sums of spreads near f64::MAX overflow inside LOWESS, while
        // one point per bucket keeps every bucket mean finite.
        let edges = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0];
        let x = [5.0, 15.0, 25.0, 35.0, 45.0];
        let y = [1e308, 1.5e308, 1e308, 1.5e308, 1e308];

        assert!(fit_primary(&x, &y, 1.0).is_none());
        let curve = fit(&x, &y, 1.0, &edges).unwrap();
        assert_eq!(curve.kind(), CurveKind::Binned);
        assert_eq!(curve.predict(20.0), 1.5e308);
    }
}
