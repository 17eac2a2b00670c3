//! Packet Engine
//!
//! Drives every captured packet through detection, accounting and
//! enforcement, and trains the anomaly model once from the first packets.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐  frames  ┌──────────────┐
//! │   Capture   │─────────▶│   Consumer   │  (single task, strict order)
//! │  (blocking) │  (mpsc)  │     task     │
//! └─────────────┘          └──────────────┘
//!                                 │
//!                     ┌───────────┴───────────┐
//!                     ▼                       ▼
//!              ┌──────────────┐       ┌──────────────┐
//!              │ Rule Engine  │       │   Anomaly    │
//!              │              │       │   Detector   │
//!              └──────────────┘       └──────────────┘
//!                     └───────────┬───────────┘
//!                                 ▼
//!                          ┌──────────────┐
//!                          │ Threat       │
//!                          │ Ledger       │
//!                          └──────────────┘
//!                                 │ escalation
//!                                 ▼
//!                          ┌──────────────┐
//!                          │ Enforcement  │
//!                          │ Gateway      │
//!                          └──────────────┘
//! ```

pub mod capture;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{decode_frame, DecodedFrame, ObservedPacket};
use crate::error::{CaptureError, TrainError};
use crate::firewall::{BlockOutcome, EnforcementGateway, FirewallBackend, UnblockOutcome};
use crate::ledger::{Recorded, ThreatLedger};
use crate::ml::{AnomalyDetector, ModelStore, TrainReport};
use crate::models::{CommandOutcome, PacketView, StatusSnapshot, ThreatView};
use crate::rules::RuleEngine;

pub use capture::{create_source, CaptureConfig, CaptureMethod, Captured, PacketSource};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Packets observed before the anomaly model is trained
    #[serde(default = "default_bootstrap_size")]
    pub bootstrap_size: usize,
    /// Packets listed in a status snapshot
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bootstrap_size: default_bootstrap_size(),
            recent_limit: default_recent_limit(),
        }
    }
}

fn default_bootstrap_size() -> usize {
    50
}

fn default_recent_limit() -> usize {
    10
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Not started, or the source ended
    Stopped,
    /// Capture worker running
    Running,
    /// Capture worker died; queries still work
    Error,
}

/// Mutable engine bookkeeping shared with the worker tasks
struct Status {
    next_id: AtomicU64,
    bootstrap_attempted: AtomicBool,
    state: RwLock<EngineState>,
    capture_error: RwLock<Option<String>>,
    stop: AtomicBool,
}

impl Status {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            bootstrap_attempted: AtomicBool::new(false),
            state: RwLock::new(EngineState::Stopped),
            capture_error: RwLock::new(None),
            stop: AtomicBool::new(false),
        }
    }
}

/// Detection and response pipeline
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    rules: Arc<RuleEngine>,
    detector: Arc<AnomalyDetector>,
    ledger: Arc<ThreatLedger>,
    gateway: Arc<EnforcementGateway>,
    store: Option<ModelStore>,
    status: Arc<Status>,
}

impl Engine {
    /// Create an engine from its components
    pub fn new(
        config: EngineConfig,
        rules: RuleEngine,
        detector: AnomalyDetector,
        ledger: ThreatLedger,
        gateway: EnforcementGateway,
    ) -> Self {
        Self {
            config,
            rules: Arc::new(rules),
            detector: Arc::new(detector),
            ledger: Arc::new(ledger),
            gateway: Arc::new(gateway),
            store: None,
            status: Arc::new(Status::new()),
        }
    }

    /// Persist the model here after bootstrap training
    pub fn with_store(mut self, store: ModelStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Build every component from configuration
    ///
    /// A stored model, if configured and readable, replaces bootstrap training.
    pub fn from_config(config: &Config, backend: Arc<dyn FirewallBackend>) -> Self {
        let store = config.model.model_path.as_ref().map(ModelStore::new);

        let detector = match &store {
            Some(store) => match store.load() {
                Ok(Some(forest)) => AnomalyDetector::with_model(config.model.clone(), forest),
                Ok(None) => AnomalyDetector::new(config.model.clone()),
                Err(e) => {
                    warn!("Ignoring stored model at {}: {:#}", store.path().display(), e);
                    AnomalyDetector::new(config.model.clone())
                }
            },
            None => AnomalyDetector::new(config.model.clone()),
        };

        let engine = Self::new(
            config.engine.clone(),
            RuleEngine::new(&config.rules),
            detector,
            ThreatLedger::new(&config.ledger),
            EnforcementGateway::new(backend),
        );

        match store {
            Some(store) => engine.with_store(store),
            None => engine,
        }
    }

    pub fn ledger(&self) -> &ThreatLedger {
        &self.ledger
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Get current state
    pub fn state(&self) -> EngineState {
        *self.status.state.read()
    }

    /// Evaluate one decoded packet
    pub async fn process(&self, frame: DecodedFrame) -> ObservedPacket {
        let id = self.status.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let packet = ObservedPacket::new(id, frame.length, Some(frame.ips), frame.transport);

        let rule_hit = self.rules.evaluate(&packet);
        let verdict = self.detector.score(&packet);

        if let Some(hit) = rule_hit {
            debug!("Packet {} from {} matched rule: {}", id, frame.ips.src, hit);
        }

        let gateway = &self.gateway;
        let Recorded { mut packet, escalation } = self.ledger.record(
            packet,
            rule_hit.is_some(),
            verdict.is_anomaly(),
            |ip| gateway.is_blocked(ip),
        );

        if let Some(escalation) = escalation {
            warn!(
                "Auto-blocking {} after {} threats",
                escalation.ip, escalation.count
            );
            match self.gateway.block(escalation.ip).await {
                BlockOutcome::Blocked => {
                    packet.blocked = true;
                    self.ledger.mark_blocked(packet.id);
                }
                BlockOutcome::AlreadyBlocked => {}
                BlockOutcome::Failed(reason) => {
                    warn!("Auto-block of {} failed: {}", escalation.ip, reason);
                }
            }
        }

        self.maybe_bootstrap();
        packet
    }

    /// Train once the bootstrap sample is complete
    fn maybe_bootstrap(&self) {
        if self.ledger.total_packets() < self.config.bootstrap_size as u64 {
            return;
        }
        if self.status.bootstrap_attempted.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.detector.is_trained() {
            debug!("Anomaly model already loaded, skipping bootstrap");
            return;
        }

        if let Err(e) = self.train_on_window() {
            warn!("Bootstrap training failed: {}; anomaly detection disabled", e);
        }
    }

    /// Train on the current packet window right away
    ///
    /// Fails with `AlreadyTrained` once a model is in place.
    pub fn train_now(&self) -> Result<TrainReport, TrainError> {
        self.train_on_window()
    }

    fn train_on_window(&self) -> Result<TrainReport, TrainError> {
        let sample = self.ledger.packet_window();
        let report = self.detector.train(&sample)?;

        if let (Some(store), Some(model)) = (&self.store, self.detector.model()) {
            if let Err(e) = store.save(&model) {
                warn!("Failed to save anomaly model: {:#}", e);
            }
        }

        Ok(report)
    }

    /// Start capturing from `source`
    ///
    /// The returned handle completes when the source ends, fails, or
    /// `stop` is called.
    pub fn start(
        &self,
        source: Box<dyn PacketSource>,
        channel_capacity: usize,
    ) -> anyhow::Result<JoinHandle<()>> {
        {
            let mut state = self.status.state.write();
            if *state == EngineState::Running {
                anyhow::bail!("Engine is already running");
            }
            *state = EngineState::Running;
        }
        self.status.stop.store(false, Ordering::SeqCst);
        *self.status.capture_error.write() = None;

        info!("Starting capture from {}", source.describe());

        let (tx, mut rx) = mpsc::channel::<DecodedFrame>(channel_capacity.max(1));
        let status = Arc::clone(&self.status);
        let capture = tokio::task::spawn_blocking(move || capture_loop(source, tx, &status));

        let engine = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                engine.process(frame).await;
            }

            let failure = match capture.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("capture worker panicked: {}", e)),
            };

            match failure {
                Some(message) => {
                    error!("Capture stopped: {}", message);
                    *engine.status.capture_error.write() = Some(message);
                    *engine.status.state.write() = EngineState::Error;
                }
                None => {
                    info!("Capture stopped");
                    *engine.status.state.write() = EngineState::Stopped;
                }
            }
        }))
    }

    /// Ask the capture worker to stop
    pub fn stop(&self) {
        self.status.stop.store(true, Ordering::SeqCst);
    }

    /// Status snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            total_packets: self.ledger.total_packets(),
            total_threats: self.ledger.total_threats(),
            anomaly_threats: self.ledger.anomaly_threats(),
            model_trained: self.detector.is_trained(),
            blocked_count: self.gateway.blocked_count(),
            recent_packets: self.recent_packets(self.config.recent_limit),
            recent_threats: self.recent_threats(),
            capture_error: self.status.capture_error.read().clone(),
        }
    }

    /// Newest `limit` packets, oldest first
    pub fn recent_packets(&self, limit: usize) -> Vec<PacketView> {
        self.ledger
            .recent_packets(limit)
            .iter()
            .map(PacketView::from)
            .collect()
    }

    /// Threats window, oldest first
    pub fn recent_threats(&self) -> Vec<ThreatView> {
        self.ledger
            .recent_threats()
            .iter()
            .map(PacketView::from)
            .collect()
    }

    pub fn blocked_ips(&self) -> Vec<IpAddr> {
        self.gateway.list_blocked()
    }

    /// Manually block an IP
    pub async fn block_ip(&self, ip: IpAddr) -> CommandOutcome {
        match self.gateway.block(ip).await {
            BlockOutcome::Blocked => CommandOutcome::ok(format!("Blocked {}", ip)),
            BlockOutcome::AlreadyBlocked => CommandOutcome::failed(format!("{} is already blocked", ip)),
            BlockOutcome::Failed(reason) => CommandOutcome::failed(format!("Failed to block {}: {}", ip, reason)),
        }
    }

    /// Manually unblock an IP
    pub async fn unblock_ip(&self, ip: IpAddr) -> CommandOutcome {
        match self.gateway.unblock(ip).await {
            UnblockOutcome::Unblocked => CommandOutcome::ok(format!("Unblocked {}", ip)),
            UnblockOutcome::NotBlocked => CommandOutcome::failed(format!("{} is not blocked", ip)),
            UnblockOutcome::Failed(reason) => {
                CommandOutcome::failed(format!("Failed to unblock {}: {}", ip, reason))
            }
        }
    }
}

/// Pull frames until the source ends, fails, or a stop is requested
fn capture_loop(
    mut source: Box<dyn PacketSource>,
    tx: mpsc::Sender<DecodedFrame>,
    status: &Status,
) -> Result<(), CaptureError> {
    let link = source.link_kind();

    while !status.stop.load(Ordering::SeqCst) {
        match source.next_frame()? {
            Captured::Frame(data) => {
                let Some(frame) = decode_frame(&data, link) else {
                    debug!("Skipping non-IP or malformed frame ({} bytes)", data.len());
                    continue;
                };
                if tx.blocking_send(frame).is_err() {
                    // Consumer gone
                    break;
                }
            }
            Captured::Idle => {}
            Captured::Finished => {
                info!("{} finished", source.describe());
                break;
            }
        }
    }

    Ok(())
}
