//! Isolation Forest implementation
//!
//! Anomaly detection using isolation trees. Anomalies are easier to isolate
//! and thus have shorter path lengths in the trees. The decision threshold is
//! taken from the training scores so that the configured contamination share
//! of the training sample lands above it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{ModelConfig, OutlierModel};
use crate::ml::features::{FeatureVector, FEATURE_COUNT};

const EULER_GAMMA: f32 = 0.577_215_7;

/// Isolation Forest model for anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    /// Individual isolation trees
    trees: Vec<IsolationTree>,
    /// Number of trees
    num_trees: usize,
    /// Upper bound on the per-tree subsample
    max_samples: usize,
    /// Subsample size actually used at fit time
    subsample_size: usize,
    /// Expected anomaly share of the training data
    contamination: f32,
    /// Seed for tree construction
    seed: u64,
    /// Scores strictly above this are anomalies
    threshold: f32,
    /// c(subsample_size), path length normalization
    avg_path_length: f32,
    /// Number of training samples
    trained_on: usize,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(&ModelConfig::default())
    }
}

impl IsolationForest {
    /// Create an unfitted forest
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            trees: Vec::new(),
            num_trees: config.num_trees.max(1),
            max_samples: config.max_samples.max(2),
            subsample_size: 0,
            contamination: config.contamination.clamp(0.0, 0.5),
            seed: config.seed,
            threshold: 1.0,
            avg_path_length: 0.0,
            trained_on: 0,
        }
    }

    /// Decision threshold derived at fit time
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Number of samples the forest was fitted on
    pub fn trained_on(&self) -> usize {
        self.trained_on
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Calculate average path length for normalization (c(n) function)
    fn average_path_length(n: usize) -> f32 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f32;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// Score a single sample
    fn score_sample(&self, sample: &FeatureVector) -> f32 {
        if self.trees.is_empty() || self.avg_path_length == 0.0 {
            return 0.5;
        }

        let total_path_length: f32 = self.trees.iter().map(|tree| tree.path_length(sample)).sum();
        let avg_path = total_path_length / self.trees.len() as f32;

        // Anomaly score: 2^(-avg_path / c(subsample_size))
        2.0_f32.powf(-avg_path / self.avg_path_length)
    }
}

impl OutlierModel for IsolationForest {
    fn fit(&mut self, data: &[FeatureVector]) {
        if data.is_empty() {
            return;
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let subsample_size = self.max_samples.min(data.len());
        let max_depth = (subsample_size as f32).log2().ceil() as usize;

        self.trees.clear();
        self.subsample_size = subsample_size;
        self.avg_path_length = Self::average_path_length(subsample_size);

        for _ in 0..self.num_trees {
            // Subsample without replacement
            let sample: Vec<FeatureVector> = rand::seq::index::sample(&mut rng, data.len(), subsample_size)
                .iter()
                .map(|idx| data[idx])
                .collect();

            let tree = IsolationTree::build(&sample, max_depth, &mut rng);
            self.trees.push(tree);
        }

        let mut scores: Vec<f32> = data.iter().map(|s| self.score_sample(s)).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        self.threshold = percentile(&scores, 1.0 - self.contamination);
        self.trained_on = data.len();
    }

    fn score(&self, sample: &FeatureVector) -> f32 {
        self.score_sample(sample)
    }

    fn predict(&self, sample: &FeatureVector) -> bool {
        self.is_fitted() && self.score(sample) > self.threshold
    }

    fn name(&self) -> &str {
        "IsolationForest"
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }
}

/// Linearly interpolated quantile of ascending `sorted`, `q` in [0, 1]
fn percentile(sorted: &[f32], q: f32) -> f32 {
    match sorted.len() {
        0 => 1.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f32;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
        }
    }
}

/// A single isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: Option<Box<IsolationNode>>,
}

impl IsolationTree {
    /// Build an isolation tree from samples
    fn build<R: Rng>(samples: &[FeatureVector], max_depth: usize, rng: &mut R) -> Self {
        let root = Self::build_node(samples, 0, max_depth, rng);
        Self { root }
    }

    /// Recursively build tree nodes
    fn build_node<R: Rng>(
        samples: &[FeatureVector],
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> Option<Box<IsolationNode>> {
        if samples.is_empty() {
            return None;
        }

        // Terminal conditions
        if depth >= max_depth || samples.len() <= 1 {
            return Some(Box::new(IsolationNode::Leaf { size: samples.len() }));
        }

        // Randomly select feature
        let feature_idx = rng.random_range(0..FEATURE_COUNT);

        // Find min/max for selected feature
        let mut min_val = f32::MAX;
        let mut max_val = f32::MIN;
        for sample in samples {
            let val = sample.get(feature_idx);
            min_val = min_val.min(val);
            max_val = max_val.max(val);
        }

        // If all values are the same, make a leaf
        if max_val - min_val < f32::EPSILON {
            return Some(Box::new(IsolationNode::Leaf { size: samples.len() }));
        }

        // Random split point
        let split_value = rng.random_range(min_val..max_val);

        let (left_samples, right_samples): (Vec<FeatureVector>, Vec<FeatureVector>) =
            samples.iter().partition(|s| s.get(feature_idx) < split_value);

        let left = Self::build_node(&left_samples, depth + 1, max_depth, rng);
        let right = Self::build_node(&right_samples, depth + 1, max_depth, rng);

        Some(Box::new(IsolationNode::Internal {
            feature_idx,
            split_value,
            left,
            right,
        }))
    }

    /// Calculate path length for a sample
    fn path_length(&self, sample: &FeatureVector) -> f32 {
        match &self.root {
            None => 0.0,
            Some(node) => Self::node_path_length(node, sample, 0),
        }
    }

    fn node_path_length(node: &IsolationNode, sample: &FeatureVector, depth: usize) -> f32 {
        match node {
            IsolationNode::Leaf { size } => {
                // Add expected path length adjustment for leaves with multiple samples
                depth as f32 + IsolationForest::average_path_length(*size)
            }
            IsolationNode::Internal {
                feature_idx,
                split_value,
                left,
                right,
            } => {
                let next_node = if sample.get(*feature_idx) < *split_value { left } else { right };

                match next_node {
                    Some(n) => Self::node_path_length(n, sample, depth + 1),
                    None => depth as f32 + 1.0,
                }
            }
        }
    }
}

/// Node in an isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    /// Internal node with split
    Internal {
        feature_idx: usize,
        split_value: f32,
        left: Option<Box<IsolationNode>>,
        right: Option<Box<IsolationNode>>,
    },
    /// Leaf node
    Leaf { size: usize },
}
