//! Static packet rules
//!
//! A packet is suspicious when it touches a known backdoor/remote-access
//! port or when its size falls outside the expected band.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::ObservedPacket;

/// Rule engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Ports that flag a packet when used as source or destination
    #[serde(default = "default_suspicious_ports")]
    pub suspicious_ports: Vec<u16>,

    /// Packets shorter than this are flagged
    #[serde(default = "default_min_length")]
    pub min_length: u32,

    /// Packets longer than this are flagged
    #[serde(default = "default_max_length")]
    pub max_length: u32,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            suspicious_ports: default_suspicious_ports(),
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

fn default_suspicious_ports() -> Vec<u16> {
    // metasploit, leet, IRC botnets, telnet, alt telnet
    vec![4444, 1337, 6667, 23, 2323]
}

fn default_min_length() -> u32 {
    30
}

fn default_max_length() -> u32 {
    1200
}

/// Which rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleHit {
    SuspiciousPort(u16),
    Oversized(u32),
    Undersized(u32),
}

impl std::fmt::Display for RuleHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleHit::SuspiciousPort(port) => write!(f, "suspicious port {}", port),
            RuleHit::Oversized(len) => write!(f, "oversized packet ({} bytes)", len),
            RuleHit::Undersized(len) => write!(f, "undersized packet ({} bytes)", len),
        }
    }
}

/// Stateless rule matcher
#[derive(Debug, Clone)]
pub struct RuleEngine {
    suspicious_ports: HashSet<u16>,
    min_length: u32,
    max_length: u32,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(&RulesConfig::default())
    }
}

impl RuleEngine {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            suspicious_ports: config.suspicious_ports.iter().copied().collect(),
            min_length: config.min_length,
            max_length: config.max_length,
        }
    }

    /// First matching rule, ports checked before size
    pub fn evaluate(&self, packet: &ObservedPacket) -> Option<RuleHit> {
        let ports = [packet.src_port(), packet.dst_port()];
        if let Some(port) = ports
            .into_iter()
            .flatten()
            .find(|port| self.suspicious_ports.contains(port))
        {
            return Some(RuleHit::SuspiciousPort(port));
        }

        if packet.length > self.max_length {
            return Some(RuleHit::Oversized(packet.length));
        }
        if packet.length < self.min_length {
            return Some(RuleHit::Undersized(packet.length));
        }

        None
    }

    pub fn is_suspicious(&self, packet: &ObservedPacket) -> bool {
        self.evaluate(packet).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpPair, Transport};

    fn packet(length: u32, transport: Transport) -> ObservedPacket {
        let ips = IpPair::new("198.51.100.7".parse().unwrap(), "10.0.0.1".parse().unwrap());
        ObservedPacket::new(1, length, Some(ips), transport)
    }

    #[test]
    fn test_benign_packet() {
        let engine = RuleEngine::default();
        let p = packet(500, Transport::Tcp { src_port: 51000, dst_port: 443 });
        assert!(!engine.is_suspicious(&p));
        assert_eq!(engine.evaluate(&p), None);
    }

    #[test]
    fn test_suspicious_ports() {
        let engine = RuleEngine::default();
        for port in [4444, 1337, 6667, 23, 2323] {
            let dst = packet(500, Transport::Tcp { src_port: 51000, dst_port: port });
            assert_eq!(engine.evaluate(&dst), Some(RuleHit::SuspiciousPort(port)));

            let src = packet(500, Transport::Udp { src_port: port, dst_port: 53 });
            assert!(engine.is_suspicious(&src));
        }
    }

    #[test]
    fn test_size_bounds() {
        let engine = RuleEngine::default();
        let tcp = Transport::Tcp { src_port: 51000, dst_port: 443 };

        assert_eq!(engine.evaluate(&packet(1201, tcp)), Some(RuleHit::Oversized(1201)));
        assert_eq!(engine.evaluate(&packet(29, tcp)), Some(RuleHit::Undersized(29)));
        // Bounds themselves are allowed
        assert!(!engine.is_suspicious(&packet(1200, tcp)));
        assert!(!engine.is_suspicious(&packet(30, tcp)));
    }

    #[test]
    fn test_other_transport_only_checks_size() {
        let engine = RuleEngine::default();
        assert!(!engine.is_suspicious(&packet(64, Transport::Other)));
        assert!(engine.is_suspicious(&packet(1500, Transport::Other)));
    }

    #[test]
    fn test_custom_config() {
        let config = RulesConfig {
            suspicious_ports: vec![31337],
            min_length: 0,
            max_length: 9000,
        };
        let engine = RuleEngine::new(&config);

        assert!(!engine.is_suspicious(&packet(10, Transport::Tcp { src_port: 1, dst_port: 4444 })));
        assert!(engine.is_suspicious(&packet(10, Transport::Tcp { src_port: 1, dst_port: 31337 })));
    }
}
