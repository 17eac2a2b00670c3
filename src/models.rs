use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

use crate::core::ObservedPacket;
use crate::engine::EngineState;

/// Flattened view of an observed packet for listings and JSON output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketView {
    pub id: u64,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub transport: String,
    pub size: u32,
    pub threat: bool,
    pub detection_method: String,
    pub blocked: bool,
    pub timestamp: DateTime<Utc>,
}

/// Entries of the threats listing
pub type ThreatView = PacketView;

impl From<&ObservedPacket> for PacketView {
    fn from(packet: &ObservedPacket) -> Self {
        Self {
            id: packet.id,
            src_ip: packet.src_ip(),
            dst_ip: packet.dst_ip(),
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            transport: packet.transport.to_string(),
            size: packet.length,
            threat: packet.threat,
            detection_method: packet.method.to_string(),
            blocked: packet.blocked,
            timestamp: packet.timestamp,
        }
    }
}

/// Point-in-time engine status
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: EngineState,
    pub total_packets: u64,
    pub total_threats: u64,
    pub anomaly_threats: u64,
    pub model_trained: bool,
    pub blocked_count: usize,
    pub recent_packets: Vec<PacketView>,
    pub recent_threats: Vec<ThreatView>,
    /// Set when the capture worker died
    pub capture_error: Option<String>,
}

/// Result of a manual block/unblock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DetectionMethod, IpPair, Transport};

    #[test]
    fn test_packet_view_from_packet() {
        let ips = IpPair::new("203.0.113.5".parse().unwrap(), "10.0.0.1".parse().unwrap());
        let mut packet = ObservedPacket::new(7, 90, Some(ips), Transport::Udp { src_port: 53, dst_port: 1337 });
        packet.threat = true;
        packet.method = DetectionMethod::RuleBased;

        let view = PacketView::from(&packet);
        assert_eq!(view.id, 7);
        assert_eq!(view.src_ip, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(view.dst_port, Some(1337));
        assert_eq!(view.transport, "UDP");
        assert_eq!(view.detection_method, "rule-based");
        assert!(!view.blocked);
    }

    #[test]
    fn test_command_outcome_json() {
        let json = serde_json::to_value(CommandOutcome::failed("203.0.113.5 is not blocked")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "203.0.113.5 is not blocked");
    }
}
