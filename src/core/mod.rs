//! Core packet types shared by all stages
//!
//! - `packet`: observed packet, transport variant, detection method
//! - `parser`: IP/TCP/UDP header extraction from captured frames

pub mod packet;
pub mod parser;

pub use packet::{DetectionMethod, IpPair, ObservedPacket, Transport};
pub use parser::{decode_frame, DecodedFrame, LinkKind};
