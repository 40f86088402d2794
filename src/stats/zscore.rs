// =============================================================================
// Z-Score Primitives — rolling per-group and cross-sectional normalisation
// =============================================================================
//
// Two standalone scores, both returned aligned to the input order:
//
//   rolling_by_group:  z_t = (x_t - mean(window_t)) / std(window_t)
//                      where window_t is the trailing `lookback_rows` values of
//                      the same group (time ascending), current value included.
//
//   cross_sectional:   z_i = (x_i - mean(group_i)) / std(group_i)
//                      over the rows of one snapshot.
//
// Standard deviations are population (divisor N).  Zero-variance windows and
// groups yield `None`, never an infinite score.

use std::collections::HashMap;
use std::hash::Hash;

use super::{population_stats, zscore};

/// Trailing rolling z-score computed independently within each group.
///
/// Rows of a group are ordered by `time` (ties keep input order).  The window
/// length is `min(group_len, lookback_rows)`; nothing is emitted until the
/// window holds at least `min_rows` observations, and a group with fewer than
/// `min_rows` rows is entirely undefined.
pub fn rolling_by_group<T, K, O>(
    rows: &[T],
    value: impl Fn(&T) -> f64,
    group: impl Fn(&T) -> K,
    time: impl Fn(&T) -> O,
    lookback_rows: usize,
    min_rows: usize,
) -> Vec<Option<f64>>
where
    K: Eq + Hash,
    O: Ord,
{
    let mut out = vec![None; rows.len()];
    let min_rows = min_rows.max(1);

    let mut groups: HashMap<K, Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        groups.entry(group(row)).or_default().push(i);
    }

    for (_, mut indices) in groups {
        if indices.len() < min_rows {
            continue;
        }
        indices.sort_by_key(|&i| time(&rows[i]));

        let series: Vec<f64> = indices.iter().map(|&i| value(&rows[i])).collect();
        let window = series.len().min(lookback_rows).max(1);

        for (pos, &row_idx) in indices.iter().enumerate() {
            let start = (pos + 1).saturating_sub(window);
            let slice = &series[start..=pos];
            if slice.len() < min_rows {
                continue;
            }
            out[row_idx] = population_stats(slice)
                .and_then(|(mean, std)| zscore(series[pos], mean, std));
        }
    }

    out
}

/// Cross-sectional z-score of each row against its group within one snapshot.
///
/// Undefined values are excluded from the group statistics and stay undefined
/// in the output.  A group with a single defined value has zero spread and
/// therefore no scores.
pub fn cross_sectional<T, K>(
    rows: &[T],
    value: impl Fn(&T) -> Option<f64>,
    group: impl Fn(&T) -> K,
) -> Vec<Option<f64>>
where
    K: Eq + Hash,
{
    let mut out = vec![None; rows.len()];

    let mut groups: HashMap<K, Vec<(usize, f64)>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if let Some(v) = value(row).filter(|v| v.is_finite()) {
            groups.entry(group(row)).or_default().push((i, v));
        }
    }

    for members in groups.values() {
        let values: Vec<f64> = members.iter().map(|&(_, v)| v).collect();
        let Some((mean, std)) = population_stats(&values) else {
            continue;
        };
        for &(i, v) in members {
            out[i] = zscore(v, mean, std);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Obs {
        group: &'static str,
        t: i64,
        v: f64,
    }

    fn obs(group: &'static str, t: i64, v: f64) -> Obs {
        Obs { group, t, v }
    }

    #[test]
    fn rolling_emits_after_min_rows() {
        let rows: Vec<Obs> = (0..6).map(|t| obs("a", t, t as f64)).collect();
        let z = rolling_by_group(&rows, |o| o.v, |o| o.group, |o| o.t, 10, 3);
        assert!(z[0].is_none());
        assert!(z[1].is_none());
        // Window [0, 1, 2]: mean 1, pop std sqrt(2/3).
        let expected = (2.0 - 1.0) / (2.0_f64 / 3.0).sqrt();
        assert!((z[2].unwrap() - expected).abs() < 1e-12);
        assert!(z[5].is_some());
    }

    #[test]
    fn rolling_short_group_is_undefined() {
        let rows = vec![obs("a", 0, 1.0), obs("a", 1, 50.0)];
        let z = rolling_by_group(&rows, |o| o.v, |o| o.group, |o| o.t, 10, 3);
        assert!(z.iter().all(Option::is_none));
    }

    #[test]
    fn rolling_respects_lookback_window() {
        // With a 2-row window, z is always +-1 for distinct consecutive values.
        let rows: Vec<Obs> = vec![1.0, 3.0, 2.0, 8.0]
            .into_iter()
            .enumerate()
            .map(|(t, v)| obs("a", t as i64, v))
            .collect();
        let z = rolling_by_group(&rows, |o| o.v, |o| o.group, |o| o.t, 2, 2);
        assert!(z[0].is_none());
        assert!((z[1].unwrap() - 1.0).abs() < 1e-12);
        assert!((z[2].unwrap() + 1.0).abs() < 1e-12);
        assert!((z[3].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rolling_sorts_by_time_and_keeps_input_alignment() {
        let rows = vec![
            obs("a", 3, 10.0),
            obs("b", 0, 5.0),
            obs("a", 1, 0.0),
            obs("a", 2, 0.0),
        ];
        let z = rolling_by_group(&rows, |o| o.v, |o| o.group, |o| o.t, 10, 3);
        // Group "a" in time order: 0, 0, 10 -> last row (input index 0) scores.
        assert!(z[0].unwrap() > 1.0);
        assert!(z[1].is_none());
        assert!(z[2].is_none());
        assert!(z[3].is_none());
    }

    #[test]
    fn rolling_flat_window_is_undefined() {
        let rows: Vec<Obs> = (0..5).map(|t| obs("a", t, 4.2)).collect();
        let z = rolling_by_group(&rows, |o| o.v, |o| o.group, |o| o.t, 10, 2);
        assert!(z.iter().all(Option::is_none));
    }

    #[test]
    fn cross_sectional_single_row_is_undefined() {
        let rows = vec![obs("btc", 0, 0.12)];
        let z = cross_sectional(&rows, |o| Some(o.v), |o| o.group);
        assert_eq!(z, vec![None]);
    }

    #[test]
    fn cross_sectional_by_group() {
        let rows = vec![
            obs("btc", 0, 1.0),
            obs("eth", 0, 100.0),
            obs("btc", 0, 3.0),
            obs("eth", 0, 100.0),
        ];
        let z = cross_sectional(&rows, |o| Some(o.v), |o| o.group);
        assert!((z[0].unwrap() + 1.0).abs() < 1e-12);
        assert!((z[2].unwrap() - 1.0).abs() < 1e-12);
        // Zero-std group.
        assert!(z[1].is_none());
        assert!(z[3].is_none());
    }

    #[test]
    fn cross_sectional_skips_undefined_inputs() {
        let rows = vec![obs("btc", 0, 1.0), obs("btc", 0, f64::NAN), obs("btc", 0, 3.0)];
        let z = cross_sectional(&rows, |o| Some(o.v), |o| o.group);
        assert!(z[0].is_some());
        assert!(z[1].is_none());
        assert!(z[2].is_some());
    }
}
