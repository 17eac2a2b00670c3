//! Bootstrap-trained anomaly detector
//!
//! The detector starts untrained and scores every packet as normal. Once a
//! bootstrap sample has been collected it is fitted exactly once; there is no
//! retraining and no online update afterwards.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::features::{extract, FeatureVector};
use super::models::{IsolationForest, ModelConfig, OutlierModel};
use crate::core::ObservedPacket;
use crate::error::TrainError;

/// Classification of a single packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Normal,
    Anomaly,
}

impl Verdict {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Verdict::Anomaly)
    }
}

/// Model lifecycle; the only transition is Untrained -> Trained
#[derive(Debug, Clone, Default)]
pub enum ModelState {
    #[default]
    Untrained,
    Trained(Arc<IsolationForest>),
}

/// Summary of a successful fit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub samples: usize,
    pub threshold: f32,
}

/// Anomaly detector wrapping the isolation forest
pub struct AnomalyDetector {
    config: ModelConfig,
    state: RwLock<ModelState>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl AnomalyDetector {
    /// Create an untrained detector
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ModelState::Untrained),
        }
    }

    /// Create a detector that is already trained, e.g. from a stored model
    pub fn with_model(config: ModelConfig, forest: IsolationForest) -> Self {
        Self {
            config,
            state: RwLock::new(ModelState::Trained(Arc::new(forest))),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_trained(&self) -> bool {
        matches!(*self.state.read(), ModelState::Trained(_))
    }

    /// The fitted forest, if training has happened
    pub fn model(&self) -> Option<Arc<IsolationForest>> {
        match &*self.state.read() {
            ModelState::Trained(forest) => Some(Arc::clone(forest)),
            ModelState::Untrained => None,
        }
    }

    /// Fit the model on a bootstrap sample
    ///
    /// Fitting runs without holding the state lock; the new model becomes
    /// visible to `score` in a single assignment.
    pub fn train(&self, samples: &[ObservedPacket]) -> Result<TrainReport, TrainError> {
        if self.is_trained() {
            return Err(TrainError::AlreadyTrained);
        }
        if samples.len() < self.config.min_samples {
            return Err(TrainError::InsufficientData {
                needed: self.config.min_samples,
                got: samples.len(),
            });
        }

        let data: Vec<FeatureVector> = samples.iter().map(extract).collect();
        let mut forest = IsolationForest::new(&self.config);
        info!("Training {} on {} packets", forest.name(), data.len());
        forest.fit(&data);

        let report = TrainReport {
            samples: data.len(),
            threshold: forest.threshold(),
        };

        let mut state = self.state.write();
        if let ModelState::Trained(_) = *state {
            return Err(TrainError::AlreadyTrained);
        }
        *state = ModelState::Trained(Arc::new(forest));
        drop(state);

        info!(
            "Anomaly model trained ({} samples, threshold {:.4})",
            report.samples, report.threshold
        );
        Ok(report)
    }

    /// Classify a packet; always `Normal` until trained
    pub fn score(&self, packet: &ObservedPacket) -> Verdict {
        let Some(forest) = self.model() else {
            return Verdict::Normal;
        };

        let features = extract(packet);
        if forest.predict(&features) {
            if tracing::enabled!(tracing::Level::DEBUG) {
                let detail: Vec<String> = features
                    .named()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect();
                debug!(
                    "Packet {} anomalous (score {:.4}): {}",
                    packet.id,
                    forest.score(&features),
                    detail.join(" ")
                );
            }
            Verdict::Anomaly
        } else {
            Verdict::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpPair, Transport};

    fn packets(n: usize) -> Vec<ObservedPacket> {
        (0..n)
            .map(|i| {
                let src = format!("198.51.100.{}", (i * 7) % 250 + 1);
                let ips = IpPair::new(src.parse().unwrap(), "10.0.0.1".parse().unwrap());
                ObservedPacket::new(
                    i as u64 + 1,
                    200 + ((i * 31) % 700) as u32,
                    Some(ips),
                    Transport::Tcp {
                        src_port: 40000 + ((i * 97) % 20000) as u16,
                        dst_port: 443,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_untrained_scores_normal() {
        let detector = AnomalyDetector::default();
        assert!(!detector.is_trained());

        let mut odd = packets(1).remove(0);
        odd.length = 65000;
        odd.transport = Transport::Udp { src_port: 1, dst_port: 65535 };
        assert_eq!(detector.score(&odd), Verdict::Normal);
    }

    #[test]
    fn test_train_insufficient_data() {
        let detector = AnomalyDetector::default();
        let err = detector.train(&packets(19)).unwrap_err();

        assert_eq!(err, TrainError::InsufficientData { needed: 20, got: 19 });
        assert!(!detector.is_trained());
        assert!(detector.model().is_none());
    }

    #[test]
    fn test_train_once() {
        let detector = AnomalyDetector::default();
        let report = detector.train(&packets(20)).unwrap();
        assert_eq!(report.samples, 20);
        assert!(detector.is_trained());

        let first = detector.model().unwrap();

        // Second call does not refit
        assert_eq!(detector.train(&packets(60)), Err(TrainError::AlreadyTrained));
        let second = detector.model().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.trained_on(), 20);
    }

    #[test]
    fn test_trained_scoring_flags_outlier_more_than_typical() {
        let detector = AnomalyDetector::default();
        let sample = packets(50);
        detector.train(&sample).unwrap();

        let forest = detector.model().unwrap();
        let typical = extract(&sample[10]);

        let mut outlier = sample[10].clone();
        outlier.length = 60000;
        outlier.transport = Transport::Udp { src_port: 1, dst_port: 65000 };
        let outlier = extract(&outlier);

        assert!(forest.score(&outlier) > forest.score(&typical));
    }

    #[test]
    fn test_with_model_starts_trained() {
        let mut forest = IsolationForest::default();
        forest.fit(&packets(30).iter().map(extract).collect::<Vec<_>>());

        let detector = AnomalyDetector::with_model(ModelConfig::default(), forest);
        assert!(detector.is_trained());
        assert_eq!(detector.train(&packets(30)), Err(TrainError::AlreadyTrained));
    }
}
