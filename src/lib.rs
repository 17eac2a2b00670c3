//! Real-time network threat detection and automated response
//!
//! Captured packets are checked against static rules and a bootstrap-trained
//! isolation forest, threats are accounted per source IP, and sources that
//! cross the escalation threshold are blocked through the host firewall.
//!
//! The [`engine::Engine`] ties the stages together:
//! - [`rules`]: port and size rules
//! - [`ml`]: feature extraction, isolation forest, model persistence
//! - [`ledger`]: retention windows, counters, escalation
//! - [`firewall`]: idempotent block/unblock over iptables or netsh

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod ledger;
pub mod ml;
pub mod models;
pub mod rules;

pub use config::Config;
pub use engine::{Engine, EngineState};
pub use error::{CaptureError, ConfigError, FirewallError, TrainError};
pub use firewall::{backend_from_config, BlockOutcome, EnforcementGateway, FirewallBackend, UnblockOutcome};
pub use models::{CommandOutcome, PacketView, StatusSnapshot};
