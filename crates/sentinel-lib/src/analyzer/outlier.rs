//! Unsupervised outlier scoring
//!
//! Two detectors back the analyzers:
//! - [`knn_scores`]: distance to the k-th nearest neighbour on a standardized
//!   1-D series, squashed into [0, 1]
//! - [`IsolationForest`]: seeded isolation forest over feature vectors

use crate::error::AnalyzerError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Neighbour rank used for distance scoring
pub const DEFAULT_K: usize = 5;

/// Fixed seed so repeated cycles over the same data agree
pub const FOREST_SEED: u64 = 42;

pub const DEFAULT_TREES: usize = 100;
pub const DEFAULT_SUBSAMPLE: usize = 256;

/// Score every point by its distance to the k-th nearest other point.
///
/// Values are standardized first (z-scores). The distance `d` is mapped to
/// `1 - exp(-d²/2)`, so a score of 0.95 corresponds to a neighbour gap of
/// roughly 2.45 standard deviations. A constant series scores all zeros.
pub fn knn_scores(values: &[f64], k: usize) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
    if sd < f64::EPSILON {
        return vec![0.0; n];
    }
    let z: Vec<f64> = values.iter().map(|v| (v - mean) / sd).collect();
    let k = k.clamp(1, n - 1);

    let mut sorted = z.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    z.iter()
        .map(|&x| {
            let d = kth_neighbour_distance(&sorted, x, k);
            1.0 - (-d * d / 2.0).exp()
        })
        .collect()
}

/// Distance from `x` (present in `sorted`) to its k-th nearest other element.
fn kth_neighbour_distance(sorted: &[f64], x: f64, k: usize) -> f64 {
    let pos = sorted.partition_point(|v| *v < x);
    // Skip the point itself and walk outwards
    let (mut lo, mut hi) = (pos as isize - 1, pos + 1);
    let mut d = 0.0;
    for _ in 0..k {
        let left = (lo >= 0).then(|| x - sorted[lo as usize]);
        let right = (hi < sorted.len()).then(|| sorted[hi] - x);
        d = match (left, right) {
            (Some(l), Some(r)) if l <= r => {
                lo -= 1;
                l
            }
            (Some(_), Some(r)) => {
                hi += 1;
                r
            }
            (Some(l), None) => {
                lo -= 1;
                l
            }
            (None, Some(r)) => {
                hi += 1;
                r
            }
            (None, None) => break,
        };
    }
    d
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// Isolation forest with scores in (0, 1]; ~0.5 is unremarkable, values
/// approaching 1 are isolated quickly and therefore anomalous.
#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
    /// Score above which a point counts as an outlier
    threshold: f64,
    /// Training range per feature
    bounds: Vec<(f64, f64)>,
    range_checked: Vec<usize>,
}

impl IsolationForest {
    /// Fit on `data`; `contamination` sets the outlier threshold as the
    /// (1 - contamination) quantile of the training scores.
    pub fn fit(
        data: &[Vec<f64>],
        n_trees: usize,
        subsample: usize,
        contamination: f64,
        seed: u64,
    ) -> Result<Self, AnalyzerError> {
        if data.len() < 2 {
            return Err(AnalyzerError::InsufficientSamples {
                have: data.len(),
                need: 2,
            });
        }
        let dims = data[0].len();
        if dims == 0 || data.iter().any(|row| row.len() != dims) {
            return Err(AnalyzerError::Numerical("ragged feature matrix".to_string()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let sample_size = subsample.min(data.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..n_trees.max(1))
            .map(|_| {
                let idx = rand::seq::index::sample(&mut rng, data.len(), sample_size);
                let rows: Vec<&[f64]> = idx.iter().map(|i| data[i].as_slice()).collect();
                build_tree(&rows, 0, max_depth, &mut rng)
            })
            .collect();

        let bounds = (0..dims)
            .map(|f| {
                data.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                    (lo.min(r[f]), hi.max(r[f]))
                })
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            threshold: 1.0,
            bounds,
            range_checked: Vec::new(),
        };

        let mut training: Vec<f64> = data.iter().map(|row| forest.score(row)).collect();
        training.sort_by(|a, b| a.total_cmp(b));
        forest.threshold = quantile(&training, 1.0 - contamination.clamp(0.0, 0.5));
        Ok(forest)
    }

    /// Treat points outside the training range on any of `features` as
    /// isolated by the first split. Plain trees cannot tell such points
    /// apart from the most extreme training sample.
    pub fn with_range_check(mut self, features: &[usize]) -> Self {
        self.range_checked = features
            .iter()
            .copied()
            .filter(|f| *f < self.bounds.len())
            .collect();
        self
    }

    pub fn score(&self, point: &[f64]) -> f64 {
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        let out_of_range = self.range_checked.iter().any(|&f| {
            let (lo, hi) = self.bounds[f];
            point[f] < lo || point[f] > hi
        });
        if out_of_range {
            return 2f64.powf(-1.0 / c);
        }
        let mean_path = self
            .trees
            .iter()
            .map(|t| path_length(t, point, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / c)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_outlier(&self, score: f64) -> bool {
        score > self.threshold
    }
}

fn build_tree(rows: &[&[f64]], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if depth >= max_depth || rows.len() <= 1 {
        return Node::Leaf { size: rows.len() };
    }
    let dims = rows[0].len();
    let splittable: Vec<(usize, f64, f64)> = (0..dims)
        .filter_map(|f| {
            let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                (lo.min(r[f]), hi.max(r[f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return Node::Leaf { size: rows.len() };
    }
    let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
    let value = rng.gen_range(lo..hi);
    let (left, right): (Vec<&[f64]>, Vec<&[f64]>) = rows.iter().partition(|r| r[feature] < value);
    Node::Split {
        feature,
        value,
        left: Box::new(build_tree(&left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            value,
            left,
            right,
        } => {
            if point[*feature] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            let harmonic = (n - 1.0).ln() + 0.577_215_664_901_532_9;
            2.0 * harmonic - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated quantile of an ascending slice
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
