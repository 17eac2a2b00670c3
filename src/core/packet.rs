//! Observed packet representation
//!
//! One `ObservedPacket` is created per captured IP packet. The capture
//! pipeline owns it while it is evaluated, then the threat ledger keeps
//! copies in its retention windows until they are evicted.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport layer of a packet, with ports only where the protocol has them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Transport {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Other,
}

impl Transport {
    pub fn src_port(&self) -> Option<u16> {
        match self {
            Transport::Tcp { src_port, .. } | Transport::Udp { src_port, .. } => Some(*src_port),
            Transport::Other => None,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self {
            Transport::Tcp { dst_port, .. } | Transport::Udp { dst_port, .. } => Some(*dst_port),
            Transport::Other => None,
        }
    }

    /// Numeric code used by the feature extractor (OTHER=0, TCP=1, UDP=2)
    pub fn code(&self) -> u8 {
        match self {
            Transport::Other => 0,
            Transport::Tcp { .. } => 1,
            Transport::Udp { .. } => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp { .. } => "TCP",
            Transport::Udp { .. } => "UDP",
            Transport::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source and destination address of an IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPair {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl IpPair {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }
}

/// Which detector flagged a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    #[default]
    None,
    RuleBased,
    Anomaly,
}

impl DetectionMethod {
    /// Resolve the method from detector outputs; rules win over the model
    pub fn resolve(rule_flag: bool, anomaly_flag: bool) -> Self {
        if rule_flag {
            DetectionMethod::RuleBased
        } else if anomaly_flag {
            DetectionMethod::Anomaly
        } else {
            DetectionMethod::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::None => "none",
            DetectionMethod::RuleBased => "rule-based",
            DetectionMethod::Anomaly => "ml-anomaly",
        }
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured packet and the outcome of evaluating it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPacket {
    /// Monotonic sequence id, unique for the process lifetime
    pub id: u64,
    /// Wall-clock capture time
    pub timestamp: DateTime<Utc>,
    /// Frame length in bytes
    pub length: u32,
    /// Addresses; `None` only for non-IP traffic
    pub ips: Option<IpPair>,
    pub transport: Transport,
    /// Set iff a rule or the anomaly model fired
    pub threat: bool,
    pub method: DetectionMethod,
    /// Set only when evaluating this packet caused a new block
    pub blocked: bool,
}

impl ObservedPacket {
    pub fn new(id: u64, length: u32, ips: Option<IpPair>, transport: Transport) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            length,
            ips,
            transport,
            threat: false,
            method: DetectionMethod::None,
            blocked: false,
        }
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.ips.map(|pair| pair.src)
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.ips.map(|pair| pair.dst)
    }

    pub fn src_port(&self) -> Option<u16> {
        self.transport.src_port()
    }

    pub fn dst_port(&self) -> Option<u16> {
        self.transport.dst_port()
    }
}
