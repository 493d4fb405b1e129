//! Short-horizon latency forecasting on a regular time grid

use crate::models::Metric;
use chrono::{DateTime, Duration, DurationRound, Utc};

/// Autoregressive order on the differenced series
pub const AR_ORDER: usize = 5;

/// Resample latencies onto a fixed grid, averaging each bucket and
/// carrying the last value forward through empty buckets.
///
/// Returns the grid start and one value per bucket. Samples without a
/// latency are skipped.
pub fn resample(metrics: &[Metric], step: Duration) -> Option<(DateTime<Utc>, Vec<f64>)> {
    let points: Vec<(DateTime<Utc>, f64)> = metrics
        .iter()
        .filter_map(|m| m.latency_ms.map(|l| (m.timestamp, l)))
        .collect();
    let first = points.iter().map(|(t, _)| *t).min()?;
    let last = points.iter().map(|(t, _)| *t).max()?;
    let start = first.duration_trunc(step).ok()?;
    let step_secs = step.num_seconds().max(1);
    let buckets = ((last - start).num_seconds() / step_secs) as usize + 1;

    let mut sums = vec![0.0; buckets];
    let mut counts = vec![0usize; buckets];
    for (t, latency) in points {
        let idx = ((t - start).num_seconds() / step_secs) as usize;
        sums[idx] += latency;
        counts[idx] += 1;
    }

    let mut out = Vec::with_capacity(buckets);
    let mut carry = None;
    for (sum, count) in sums.into_iter().zip(counts) {
        if count > 0 {
            carry = Some(sum / count as f64);
        }
        // The first bucket always holds the earliest sample
        out.push(carry?);
    }
    Some((start, out))
}

/// Forecast `steps` values past the end of `series` with an AR(p) model
/// fitted to first differences (no constant term).
///
/// The order drops from `order` towards zero until the least-squares fit is
/// solvable and its coefficients satisfy `Σ|φ| < 1`; order zero is a flat
/// forecast at the last value.
pub fn forecast(series: &[f64], steps: usize, order: usize) -> Option<Vec<f64>> {
    let last = *series.last()?;
    if series.len() < 2 {
        return Some(vec![last; steps]);
    }
    let diffs: Vec<f64> = series.windows(2).map(|w| w[1] - w[0]).collect();

    let coeffs = (1..=order.min(diffs.len() / 2))
        .rev()
        .find_map(|p| fit_ar(&diffs, p).filter(|phi| phi.iter().map(|c| c.abs()).sum::<f64>() < 1.0))
        .unwrap_or_default();

    let mut history = diffs;
    let mut level = last;
    let mut out = Vec::with_capacity(steps);
    for _ in 0..steps {
        let next_diff: f64 = coeffs
            .iter()
            .enumerate()
            .map(|(j, phi)| phi * history[history.len() - 1 - j])
            .sum();
        history.push(next_diff);
        level += next_diff;
        out.push(level);
    }
    out.iter().all(|v| v.is_finite()).then_some(out)
}

/// Least-squares AR(p) coefficients for `x_t = Σ φ_j x_{t-j}`
fn fit_ar(x: &[f64], p: usize) -> Option<Vec<f64>> {
    if x.len() <= p {
        return None;
    }
    // Normal equations: (XᵀX) φ = Xᵀy
    let mut xtx = vec![vec![0.0; p]; p];
    let mut xty = vec![0.0; p];
    for t in p..x.len() {
        for i in 0..p {
            let xi = x[t - 1 - i];
            xty[i] += xi * x[t];
            for j in 0..p {
                xtx[i][j] += xi * x[t - 1 - j];
            }
        }
    }
    solve(xtx, xty)
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Environment;
    use chrono::TimeZone;

    fn at(secs: i64, latency: f64) -> Metric {
        Metric {
            api_id: "api".to_string(),
            endpoint: "/x".to_string(),
            method: "GET".to_string(),
            environment: Environment::Aws,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs),
            latency_ms: Some(latency),
            status_code: Some(200),
            success: true,
            error_message: None,
        }
    }

    #[test]
    fn test_resample_averages_and_forward_fills() {
        let metrics = vec![at(0, 100.0), at(30, 200.0), at(200, 50.0)];
        let (_, series) = resample(&metrics, Duration::minutes(1)).unwrap();
        assert_eq!(series, vec![150.0, 150.0, 150.0, 50.0]);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], Duration::minutes(1)).is_none());
    }

    #[test]
    fn test_forecast_flat_series_stays_flat() {
        let series = vec![100.0; 40];
        let out = forecast(&series, 30, AR_ORDER).unwrap();
        assert_eq!(out.len(), 30);
        assert!(out.iter().all(|v| (v - 100.0).abs() < 1e-9));
    }

    #[test]
    fn test_forecast_is_finite_on_noisy_series() {
        let series: Vec<f64> = (0..60)
            .map(|i| 100.0 + ((i * 37) % 11) as f64 - 5.0)
            .collect();
        let out = forecast(&series, 30, AR_ORDER).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_solve_linear_system() {
        let x = solve(vec![vec![2.0, 1.0], vec![1.0, 3.0]], vec![3.0, 5.0]).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-9);
        assert!((x[1] - 1.4).abs() < 1e-9);
        assert!(solve(vec![vec![0.0, 0.0], vec![0.0, 0.0]], vec![1.0, 1.0]).is_none());
    }
}
