//! Packet capture sources
//!
//! Supports:
//! - live capture on an interface (pcap)
//! - pcap file replay
//! - in-memory frames (tests, replays built in code)
//!
//! Sources are blocking; the engine drives them from a dedicated thread.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::LinkKind;
use crate::error::CaptureError;

/// BPF filter applied to live captures
const IP_FILTER: &str = "ip or ip6";

/// Capture method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Live interface capture
    #[default]
    Live,
    /// PCAP file replay
    Pcap,
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub method: CaptureMethod,
    /// Interface name; the default device is used when unset
    #[serde(default)]
    pub interface: Option<String>,
    /// PCAP file path (for pcap method)
    #[serde(default)]
    pub pcap_file: Option<PathBuf>,
    /// Snapshot length
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i32,
    /// Enable promiscuous mode
    #[serde(default = "default_true")]
    pub promiscuous: bool,
    /// Frames buffered between the capture thread and the pipeline
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            method: CaptureMethod::Live,
            interface: None,
            pcap_file: None,
            snaplen: default_snaplen(),
            timeout_ms: default_timeout_ms(),
            promiscuous: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_snaplen() -> i32 {
    65535
}

fn default_timeout_ms() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    4096
}

/// One read from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Frame(Vec<u8>),
    /// Read timeout with nothing captured
    Idle,
    /// Source exhausted (end of file)
    Finished,
}

/// Trait for packet capture implementations
pub trait PacketSource: Send {
    /// Block until the next frame, a timeout, or the end of the source
    fn next_frame(&mut self) -> Result<Captured, CaptureError>;

    /// Link-layer framing of the returned frames
    fn link_kind(&self) -> LinkKind;

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

/// Map a pcap datalink type to the framing we can decode
fn link_kind_for(linktype: pcap::Linktype, target: &str) -> Result<LinkKind, CaptureError> {
    match linktype.0 {
        1 => Ok(LinkKind::Ethernet),
        113 => Ok(LinkKind::LinuxSll),
        12 | 14 | 101 => Ok(LinkKind::RawIp),
        other => Err(CaptureError::Open {
            target: target.to_string(),
            reason: format!("unsupported link type {}", other),
        }),
    }
}

/// Live capture on a network interface
pub struct LiveCapture {
    capture: pcap::Capture<pcap::Active>,
    interface: String,
    link: LinkKind,
}

impl LiveCapture {
    pub fn new(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let interface = match &config.interface {
            Some(name) => name.clone(),
            None => pcap::Device::lookup()
                .map_err(|e| CaptureError::Open {
                    target: "default device".to_string(),
                    reason: e.to_string(),
                })?
                .ok_or(CaptureError::NoDevice)?
                .name,
        };

        let open_err = |e: pcap::Error| CaptureError::Open {
            target: interface.clone(),
            reason: e.to_string(),
        };

        let mut capture = pcap::Capture::from_device(interface.as_str())
            .map_err(open_err)?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .map_err(open_err)?;

        capture
            .filter(IP_FILTER, true)
            .map_err(|e| CaptureError::Filter {
                filter: IP_FILTER.to_string(),
                reason: e.to_string(),
            })?;

        let link = link_kind_for(capture.get_datalink(), &interface)?;
        info!("Capturing on {} ({:?})", interface, link);

        Ok(Self {
            capture,
            interface,
            link,
        })
    }
}

impl PacketSource for LiveCapture {
    fn next_frame(&mut self) -> Result<Captured, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Captured::Frame(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(Captured::Idle),
            Err(e) => Err(CaptureError::Read(e.to_string())),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn describe(&self) -> String {
        format!("interface {}", self.interface)
    }
}

/// PCAP file replay capture
pub struct FileCapture {
    capture: pcap::Capture<pcap::Offline>,
    path: PathBuf,
    link: LinkKind,
}

impl FileCapture {
    pub fn new(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let path = config
            .pcap_file
            .clone()
            .ok_or_else(|| CaptureError::Config("PCAP file path required".to_string()))?;

        let target = path.display().to_string();
        let capture = pcap::Capture::from_file(&path).map_err(|e| CaptureError::Open {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        let link = link_kind_for(capture.get_datalink(), &target)?;
        info!("Replaying {} ({:?})", target, link);

        Ok(Self { capture, path, link })
    }
}

impl PacketSource for FileCapture {
    fn next_frame(&mut self) -> Result<Captured, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Captured::Frame(packet.data.to_vec())),
            Err(pcap::Error::NoMorePackets) => Ok(Captured::Finished),
            Err(e) => Err(CaptureError::Read(e.to_string())),
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Frames held in memory, optionally ending in a read error
pub struct MemoryCapture {
    frames: VecDeque<Vec<u8>>,
    link: LinkKind,
    error: Option<String>,
}

impl MemoryCapture {
    pub fn new(frames: Vec<Vec<u8>>, link: LinkKind) -> Self {
        Self {
            frames: frames.into(),
            link,
            error: None,
        }
    }

    /// Fail with a read error once the frames run out
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

impl PacketSource for MemoryCapture {
    fn next_frame(&mut self) -> Result<Captured, CaptureError> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Captured::Frame(frame));
        }
        match self.error.take() {
            Some(message) => Err(CaptureError::Read(message)),
            None => {
                debug!("In-memory source exhausted");
                Ok(Captured::Finished)
            }
        }
    }

    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn describe(&self) -> String {
        format!("memory ({} frames left)", self.frames.len())
    }
}

/// Create a capture based on configuration
pub fn create_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    match config.method {
        CaptureMethod::Live => Ok(Box::new(LiveCapture::new(config)?)),
        CaptureMethod::Pcap => Ok(Box::new(FileCapture::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.method, CaptureMethod::Live);
        assert_eq!(config.channel_capacity, 4096);
        assert!(config.promiscuous);
        assert!(config.interface.is_none());
    }

    #[test]
    fn test_memory_capture() {
        let mut source = MemoryCapture::new(vec![vec![1, 2], vec![3]], LinkKind::RawIp);
        assert_eq!(source.link_kind(), LinkKind::RawIp);

        assert_eq!(source.next_frame().unwrap(), Captured::Frame(vec![1, 2]));
        assert_eq!(source.next_frame().unwrap(), Captured::Frame(vec![3]));
        assert_eq!(source.next_frame().unwrap(), Captured::Finished);
    }

    #[test]
    fn test_memory_capture_error() {
        let mut source = MemoryCapture::new(vec![vec![0]], LinkKind::Ethernet).failing_with("link down");

        assert!(matches!(source.next_frame(), Ok(Captured::Frame(_))));
        assert!(matches!(source.next_frame(), Err(CaptureError::Read(msg)) if msg == "link down"));
    }

    #[test]
    fn test_pcap_method_requires_file() {
        let config = CaptureConfig {
            method: CaptureMethod::Pcap,
            ..CaptureConfig::default()
        };
        assert!(matches!(create_source(&config), Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_missing_pcap_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = CaptureConfig {
            method: CaptureMethod::Pcap,
            pcap_file: Some(temp.path().join("missing.pcap")),
            ..CaptureConfig::default()
        };
        assert!(matches!(create_source(&config), Err(CaptureError::Open { .. })));
    }

    #[test]
    fn test_link_kind_mapping() {
        assert_eq!(link_kind_for(pcap::Linktype(1), "x").unwrap(), LinkKind::Ethernet);
        assert_eq!(link_kind_for(pcap::Linktype(113), "x").unwrap(), LinkKind::LinuxSll);
        assert_eq!(link_kind_for(pcap::Linktype(101), "x").unwrap(), LinkKind::RawIp);
        assert!(link_kind_for(pcap::Linktype(127), "x").is_err());
    }
}
