//! Packet feature extraction
//!
//! Maps an observed packet to the fixed-length numeric vector the anomaly
//! model is trained and scored on.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::core::ObservedPacket;

/// Number of features per packet
pub const FEATURE_COUNT: usize = 5;

/// Feature names, in vector order
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "length",
    "src_port",
    "dst_port",
    "transport",
    "src_last_octet",
];

/// Fixed-size numeric view of a packet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: [f32; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn new(features: [f32; FEATURE_COUNT]) -> Self {
        Self { features }
    }

    pub fn get(&self, idx: usize) -> f32 {
        self.features.get(idx).copied().unwrap_or(0.0)
    }

    /// Feature name/value pairs, for logging
    pub fn named(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.features.iter().copied())
    }
}

/// Extract the feature vector of a packet
///
/// Missing ports and non-IPv4 sources degrade to zero instead of failing.
pub fn extract(packet: &ObservedPacket) -> FeatureVector {
    let last_octet = match packet.src_ip() {
        Some(IpAddr::V4(v4)) => v4.octets()[3] as f32,
        _ => 0.0,
    };

    FeatureVector::new([
        packet.length as f32,
        packet.src_port().unwrap_or(0) as f32,
        packet.dst_port().unwrap_or(0) as f32,
        packet.transport.code() as f32,
        last_octet,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IpPair, Transport};

    #[test]
    fn test_extract_tcp() {
        let ips = IpPair::new("203.0.113.5".parse().unwrap(), "10.0.0.1".parse().unwrap());
        let packet = ObservedPacket::new(
            1,
            840,
            Some(ips),
            Transport::Tcp { src_port: 51000, dst_port: 443 },
        );

        let fv = extract(&packet);
        assert_eq!(fv.features, [840.0, 51000.0, 443.0, 1.0, 5.0]);
    }

    #[test]
    fn test_extract_other_transport() {
        let ips = IpPair::new("198.51.100.200".parse().unwrap(), "10.0.0.1".parse().unwrap());
        let packet = ObservedPacket::new(1, 98, Some(ips), Transport::Other);

        let fv = extract(&packet);
        assert_eq!(fv.features, [98.0, 0.0, 0.0, 0.0, 200.0]);
    }

    #[test]
    fn test_extract_degrades_to_zero() {
        // No addresses at all
        let packet = ObservedPacket::new(1, 60, None, Transport::Udp { src_port: 53, dst_port: 5353 });
        assert_eq!(extract(&packet).get(4), 0.0);
        assert_eq!(extract(&packet).get(3), 2.0);

        // IPv6 source has no IPv4 octet
        let ips = IpPair::new("2001:db8::1".parse().unwrap(), "2001:db8::2".parse().unwrap());
        let packet = ObservedPacket::new(1, 60, Some(ips), Transport::Other);
        assert_eq!(extract(&packet).get(4), 0.0);
    }

    #[test]
    fn test_named_features() {
        let fv = FeatureVector::new([1.0, 2.0, 3.0, 4.0, 5.0]);
        let named: Vec<_> = fv.named().collect();
        assert_eq!(named[0], ("length", 1.0));
        assert_eq!(named[4], ("src_last_octet", 5.0));
        assert_eq!(fv.get(99), 0.0);
    }
}
