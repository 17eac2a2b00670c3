//! Threat ledger
//!
//! Keeps the bounded packet/threat windows, the global counters and the
//! per-source-IP threat counts, and decides when a source should be
//! escalated to the enforcement gateway.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{DetectionMethod, ObservedPacket};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Capacity of the all-packets window
    #[serde(default = "default_packet_window")]
    pub packet_window: usize,

    /// Capacity of the threats window
    #[serde(default = "default_threat_window")]
    pub threat_window: usize,

    /// Threats from one source before it is escalated
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u64,

    /// Networks that are never escalated (CIDR notation)
    #[serde(default = "default_private_ranges")]
    pub private_ranges: Vec<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            packet_window: default_packet_window(),
            threat_window: default_threat_window(),
            escalation_threshold: default_escalation_threshold(),
            private_ranges: default_private_ranges(),
        }
    }
}

fn default_packet_window() -> usize {
    100
}

fn default_threat_window() -> usize {
    10
}

fn default_escalation_threshold() -> u64 {
    3
}

fn default_private_ranges() -> Vec<String> {
    vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()]
}

/// Bounded FIFO that evicts the oldest entry when full
#[derive(Debug, Clone)]
pub struct RetentionQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RetentionQueue<T> {
    /// Create a queue; a zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted one if the queue was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.items.iter_mut()
    }

    /// The newest `n` items, oldest first
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Signal that a source crossed the auto-block threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Escalation {
    pub ip: IpAddr,
    pub count: u64,
}

/// Result of recording one packet
#[derive(Debug, Clone)]
pub struct Recorded {
    pub packet: ObservedPacket,
    pub escalation: Option<Escalation>,
}

/// Loopback, unspecified or link-local
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || v6.is_unicast_link_local(),
    }
}

/// Per-source threat accounting
pub struct ThreatLedger {
    threshold: u64,
    private_ranges: Vec<IpNetwork>,
    total_packets: AtomicU64,
    total_threats: AtomicU64,
    anomaly_threats: AtomicU64,
    packets: Mutex<RetentionQueue<ObservedPacket>>,
    threats: Mutex<RetentionQueue<ObservedPacket>>,
    counts: Mutex<HashMap<IpAddr, u64>>,
}

impl Default for ThreatLedger {
    fn default() -> Self {
        Self::new(&LedgerConfig::default())
    }
}

impl ThreatLedger {
    pub fn new(config: &LedgerConfig) -> Self {
        let mut private_ranges = Vec::new();
        for range in &config.private_ranges {
            match range.parse::<IpNetwork>() {
                Ok(network) => private_ranges.push(network),
                Err(e) => warn!("Ignoring invalid private range {}: {}", range, e),
            }
        }

        Self {
            threshold: config.escalation_threshold.max(1),
            private_ranges,
            total_packets: AtomicU64::new(0),
            total_threats: AtomicU64::new(0),
            anomaly_threats: AtomicU64::new(0),
            packets: Mutex::new(RetentionQueue::new(config.packet_window)),
            threats: Mutex::new(RetentionQueue::new(config.threat_window)),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an address falls in one of the configured private ranges
    pub fn is_private(&self, ip: &IpAddr) -> bool {
        self.private_ranges.iter().any(|net| net.contains(*ip))
    }

    /// Annotate a packet with the detection outcome and account for it
    ///
    /// `is_blocked` is consulted only when a source reaches the threshold.
    pub fn record<F>(
        &self,
        mut packet: ObservedPacket,
        rule_flag: bool,
        anomaly_flag: bool,
        is_blocked: F,
    ) -> Recorded
    where
        F: Fn(&IpAddr) -> bool,
    {
        packet.threat = rule_flag || anomaly_flag;
        packet.method = DetectionMethod::resolve(rule_flag, anomaly_flag);

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.packets.lock().push(packet.clone());

        if !packet.threat {
            return Recorded {
                packet,
                escalation: None,
            };
        }

        self.total_threats.fetch_add(1, Ordering::Relaxed);
        if packet.method == DetectionMethod::Anomaly {
            self.anomaly_threats.fetch_add(1, Ordering::Relaxed);
        }

        let count = match packet.src_ip() {
            Some(ip) if !is_local(&ip) => {
                let mut counts = self.counts.lock();
                let entry = counts.entry(ip).or_insert(0);
                *entry += 1;
                Some((ip, *entry))
            }
            _ => None,
        };

        self.threats.lock().push(packet.clone());

        let escalation = count.and_then(|(ip, count)| {
            if count < self.threshold {
                return None;
            }
            if self.is_private(&ip) {
                debug!("{} reached {} threats but is in a private range", ip, count);
                return None;
            }
            if is_blocked(&ip) {
                return None;
            }
            info!("Escalating {} after {} threats", ip, count);
            Some(Escalation { ip, count })
        });

        Recorded { packet, escalation }
    }

    /// Set the blocked flag on the retained copies of a packet
    pub fn mark_blocked(&self, id: u64) {
        for queue in [&self.packets, &self.threats] {
            let mut queue = queue.lock();
            let retained = queue.iter_mut().rev().find(|p| p.id == id);
            if let Some(packet) = retained {
                packet.blocked = true;
            }
        }
    }

    /// Threat count for a source (0 if never flagged)
    pub fn threat_count(&self, ip: &IpAddr) -> u64 {
        self.counts.lock().get(ip).copied().unwrap_or(0)
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets.load(Ordering::Relaxed)
    }

    pub fn total_threats(&self) -> u64 {
        self.total_threats.load(Ordering::Relaxed)
    }

    pub fn anomaly_threats(&self) -> u64 {
        self.anomaly_threats.load(Ordering::Relaxed)
    }

    /// Newest `n` packets from the all-packets window, oldest first
    pub fn recent_packets(&self, n: usize) -> Vec<ObservedPacket> {
        self.packets.lock().recent(n)
    }

    /// Whole threats window, oldest first
    pub fn recent_threats(&self) -> Vec<ObservedPacket> {
        self.threats.lock().to_vec()
    }

    /// Copy of the all-packets window, used as the bootstrap sample
    pub fn packet_window(&self) -> Vec<ObservedPacket> {
        self.packets.lock().to_vec()
    }
}
