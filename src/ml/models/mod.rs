//! Outlier estimators
//!
//! The anomaly detector is written against `OutlierModel`; the isolation
//! forest is the only implementation.

pub mod isolation_forest;

pub use isolation_forest::IsolationForest;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::features::FeatureVector;

/// Trait for unsupervised outlier estimators
pub trait OutlierModel: Send + Sync {
    /// Fit on unlabeled, presumed mostly-normal data
    fn fit(&mut self, data: &[FeatureVector]);

    /// Score a sample (higher = more anomalous)
    fn score(&self, sample: &FeatureVector) -> f32;

    /// Binary decision from the fitted boundary
    fn predict(&self, sample: &FeatureVector) -> bool;

    /// Get model name
    fn name(&self) -> &str;

    /// Check if model has been fitted
    fn is_fitted(&self) -> bool;
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Minimum packets required before training is allowed
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Expected share of anomalies in the training sample
    #[serde(default = "default_contamination")]
    pub contamination: f32,
    /// Number of isolation trees
    #[serde(default = "default_num_trees")]
    pub num_trees: usize,
    /// Subsample size per tree (capped by the sample size)
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Random seed for reproducible training
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Where to persist the trained model (not persisted when unset)
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            contamination: default_contamination(),
            num_trees: default_num_trees(),
            max_samples: default_max_samples(),
            seed: default_seed(),
            model_path: None,
        }
    }
}

fn default_min_samples() -> usize {
    20
}

fn default_contamination() -> f32 {
    0.15
}

fn default_num_trees() -> usize {
    100
}

fn default_max_samples() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}
