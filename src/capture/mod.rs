pub mod classify;
pub mod decode;
#[cfg(feature = "pcap")]
pub mod live;
pub mod replay;
pub mod stats;

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sink::{EventSender, FlowEvent};

use self::classify::FlowClassifier;
use self::stats::PacketStats;

/// Source and destination addresses of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkPair {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Source and destination transport ports of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub src: u16,
    pub dst: u16,
}

/// Endpoint layers found in a packet. Either may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Endpoints {
    pub network: Option<NetworkPair>,
    pub transport: Option<PortPair>,
}

/// One captured packet, consumed once by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEvent {
    pub timestamp: SystemTime,
    /// Length of the packet on the wire, not the captured slice.
    pub length: u64,
    pub endpoints: Endpoints,
}

/// Result of polling a packet source.
#[derive(Debug)]
pub enum SourcePoll {
    Packet(PacketEvent),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The source has no more packets.
    Exhausted,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("opening capture file {}", .path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading capture file {}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: pcap_file::PcapError,
    },

    #[error("unsupported link type {0}")]
    UnsupportedLink(String),

    #[cfg(feature = "pcap")]
    #[error("capturing on device {device}")]
    Live {
        device: String,
        #[source]
        source: pcap::Error,
    },

    #[error("no capture device named {0:?}")]
    DeviceNotFound(String),

    #[error("invalid device selection {0:?}")]
    InvalidSelection(String),

    #[error("device {0} has no address")]
    NoAddress(String),
}

/// A blocking producer of captured packets.
pub trait PacketSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Reads the next packet, blocking at most for the source's read timeout.
    fn next_packet(&mut self) -> Result<SourcePoll, CaptureError>;
}

/// Why the capture loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    Cancelled,
    Exhausted,
    SinkClosed,
}

/// Classifies every packet from `source` and forwards it to the sink.
///
/// Runs on a blocking thread. Sending blocks when the sink queue is full,
/// so packets are never dropped.
pub fn run_capture(
    source: &mut dyn PacketSource,
    classifier: &FlowClassifier,
    sink: &EventSender,
    stats: &PacketStats,
    cancel: &CancellationToken,
) -> Result<CaptureEnd, CaptureError> {
    info!(
        source = source.name(),
        local = %classifier.local_addr(),
        "capture started"
    );

    loop {
        if cancel.is_cancelled() {
            return Ok(CaptureEnd::Cancelled);
        }

        let packet = match source.next_packet()? {
            SourcePoll::Packet(packet) => packet,
            SourcePoll::Idle => continue,
            SourcePoll::Exhausted => return Ok(CaptureEnd::Exhausted),
        };

        let key = classifier.classify(&packet);
        stats.record(key.direction, packet.length);
        debug!(flow = %key, size = packet.length, "packet");

        let event = FlowEvent {
            key,
            size: packet.length,
            timestamp: packet.timestamp,
        };
        if sink.blocking_send(event).is_err() {
            return Ok(CaptureEnd::SinkClosed);
        }
    }
}
