//! Header extraction for captured frames
//!
//! Only the IP and TCP/UDP headers are looked at; everything above the
//! transport layer is ignored. Non-IP and malformed frames yield `None`.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};

use super::packet::{IpPair, Transport};

/// Link-layer framing of the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    #[default]
    Ethernet,
    /// Linux "cooked" capture (the `any` device)
    LinuxSll,
    /// Bare IP packets without a link header
    RawIp,
}

/// Header fields of an IP packet, before any detection ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub length: u32,
    pub ips: IpPair,
    pub transport: Transport,
}

impl DecodedFrame {
    pub fn new(length: u32, ips: IpPair, transport: Transport) -> Self {
        Self { length, ips, transport }
    }
}

/// Parse the IP layer, returning `None` for ARP and other non-IP traffic
pub fn parse_ip(sliced: &SlicedPacket<'_>) -> Option<IpPair> {
    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            Some(IpPair::new(
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
            ))
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            Some(IpPair::new(
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
            ))
        }
        _ => None,
    }
}

/// Parse the transport layer; anything but TCP/UDP is `Other`
pub fn parse_transport(sliced: &SlicedPacket<'_>) -> Transport {
    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Transport::Tcp {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        },
        Some(TransportSlice::Udp(udp)) => Transport::Udp {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
        },
        _ => Transport::Other,
    }
}

/// Decode a captured frame into its IP/transport header fields
pub fn decode_frame(data: &[u8], link: LinkKind) -> Option<DecodedFrame> {
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkKind::LinuxSll => SlicedPacket::from_linux_sll(data).ok()?,
        LinkKind::RawIp => {
            let version = data.first().map(|b| b >> 4)?;
            if version != 4 && version != 6 {
                return None;
            }
            SlicedPacket::from_ip(data).ok()?
        }
    };

    let ips = parse_ip(&sliced)?;
    let transport = parse_transport(&sliced);

    Some(DecodedFrame {
        length: data.len() as u32,
        ips,
        transport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb], [0, 0x11, 0x22, 0x33, 0x44, 0x55])
            .ipv4(src, dst, 64)
            .tcp(src_port, dst_port, 1, 65535);
        let payload = [0u8; 10];
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, &payload).unwrap();
        out
    }

    #[test]
    fn test_decode_ethernet_tcp() {
        let data = tcp_frame([192, 168, 1, 100], [10, 0, 0, 1], 12345, 80);
        let frame = decode_frame(&data, LinkKind::Ethernet).unwrap();

        assert_eq!(frame.length as usize, data.len());
        assert_eq!(frame.ips.src.to_string(), "192.168.1.100");
        assert_eq!(frame.ips.dst.to_string(), "10.0.0.1");
        assert_eq!(frame.transport, Transport::Tcp { src_port: 12345, dst_port: 80 });
    }

    #[test]
    fn test_decode_udp_raw_ip() {
        let builder = PacketBuilder::ipv4([203, 0, 113, 5], [10, 0, 0, 1], 64).udp(5000, 6667);
        let mut data = Vec::new();
        builder.write(&mut data, &[1, 2, 3]).unwrap();

        let frame = decode_frame(&data, LinkKind::RawIp).unwrap();
        assert_eq!(frame.transport, Transport::Udp { src_port: 5000, dst_port: 6667 });
        assert_eq!(frame.length as usize, data.len());
    }

    #[test]
    fn test_decode_icmp_is_other() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([198, 51, 100, 7], [10, 0, 0, 1], 64)
            .icmpv4_echo_request(1, 1);
        let mut data = Vec::new();
        builder.write(&mut data, &[0u8; 8]).unwrap();

        let frame = decode_frame(&data, LinkKind::Ethernet).unwrap();
        assert_eq!(frame.transport, Transport::Other);
        assert_eq!(frame.transport.src_port(), None);
    }

    #[test]
    fn test_non_ip_and_garbage_are_skipped() {
        // ARP ethertype with a short body
        let mut arp = vec![0xff; 12];
        arp.extend_from_slice(&[0x08, 0x06]);
        arp.extend_from_slice(&[0u8; 28]);
        assert!(decode_frame(&arp, LinkKind::Ethernet).is_none());

        assert!(decode_frame(&[0x45, 0x00], LinkKind::Ethernet).is_none());
        assert!(decode_frame(&[], LinkKind::RawIp).is_none());
        assert!(decode_frame(&[0x20, 0, 0, 0], LinkKind::RawIp).is_none());
    }
}
