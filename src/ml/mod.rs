//! Machine learning anomaly detection
//!
//! Packets are mapped to a small feature vector (`features`), an isolation
//! forest is fitted once on a bootstrap sample (`models`, `anomaly`), and the
//! fitted model can be persisted across restarts (`storage`).

pub mod anomaly;
pub mod features;
pub mod models;
pub mod storage;

pub use anomaly::{AnomalyDetector, ModelState, TrainReport, Verdict};
pub use features::{extract, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use models::{IsolationForest, ModelConfig, OutlierModel};
pub use storage::ModelStore;
