//! Bounded per-group sample history

use crate::models::Metric;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Default number of samples retained per group
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Ring buffer of metric samples, evicting the oldest first.
///
/// Samples older than or equal to the newest stored timestamp are ignored,
/// so feeding overlapping analysis windows does not duplicate points.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    samples: VecDeque<Metric>,
    capacity: usize,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    /// Append samples newer than the newest stored one. Input must be time-ordered.
    pub fn extend<'a>(&mut self, metrics: impl IntoIterator<Item = &'a Metric>) {
        let mut newest = self.samples.back().map(|m| m.timestamp);
        for m in metrics {
            if newest.map_or(true, |t| m.timestamp > t) {
                newest = Some(m.timestamp);
                self.samples.push_back(m.clone());
                if self.samples.len() > self.capacity {
                    self.samples.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.samples.iter()
    }

    pub fn mean_latency(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|m| m.latency_ms))
    }

    pub fn error_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let errors = self.samples.iter().filter(|m| m.is_error()).count();
        Some(errors as f64 / self.samples.len() as f64)
    }
}

/// Histories keyed by an arbitrary group key
#[derive(Debug)]
pub struct HistoryStore<K> {
    groups: HashMap<K, MetricHistory>,
    capacity: usize,
}

impl<K: Eq + Hash> HistoryStore<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: HashMap::new(),
            capacity,
        }
    }

    pub fn entry(&mut self, key: K) -> &mut MetricHistory {
        let capacity = self.capacity;
        self.groups
            .entry(key)
            .or_insert_with(|| MetricHistory::new(capacity))
    }

    pub fn get(&self, key: &K) -> Option<&MetricHistory> {
        self.groups.get(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Arithmetic mean, `None` for an empty input
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values.iter().copied())?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Environment;
    use chrono::{Duration, TimeZone, Utc};

    fn sample(offset_secs: i64, latency: f64) -> Metric {
        Metric {
            api_id: "api".to_string(),
            endpoint: "/x".to_string(),
            method: "GET".to_string(),
            environment: Environment::Aws,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            latency_ms: Some(latency),
            status_code: Some(200),
            success: true,
            error_message: None,
        }
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = MetricHistory::new(3);
        let samples: Vec<_> = (0..5).map(|i| sample(i, i as f64)).collect();
        history.extend(&samples);

        assert_eq!(history.len(), 3);
        let latencies: Vec<_> = history.iter().filter_map(|m| m.latency_ms).collect();
        assert_eq!(latencies, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_history_skips_overlapping_samples() {
        let mut history = MetricHistory::new(100);
        let first: Vec<_> = (0..10).map(|i| sample(i, 1.0)).collect();
        let overlap: Vec<_> = (5..15).map(|i| sample(i, 1.0)).collect();
        history.extend(&first);
        history.extend(&overlap);
        assert_eq!(history.len(), 15);
    }

    #[test]
    fn test_mean_and_std_dev() {
        assert_eq!(mean(Vec::<f64>::new()), None);
        assert_eq!(mean(vec![1.0, 2.0, 3.0]), Some(2.0));
        let sd = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
    }
}
