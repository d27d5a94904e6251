use std::net::IpAddr;

use etherparse::{InternetSlice, ReadError, SlicedPacket, TransportSlice};
use thiserror::Error;

use super::{Endpoints, NetworkPair, PortPair};

/// Framing of captured packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Bare IPv4 or IPv6 packets with no link header.
    RawIp,
}

impl LinkLayer {
    /// Maps a pcap LINKTYPE value to a supported framing.
    pub fn from_linktype(linktype: u32) -> Option<Self> {
        match linktype {
            1 => Some(Self::Ethernet),
            // LINKTYPE_RAW, plus the BSD alias and the IPv4/IPv6-only variants.
            12 | 14 | 101 | 228 | 229 => Some(Self::RawIp),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed {link:?} frame")]
    Malformed {
        link: LinkLayer,
        #[source]
        source: ReadError,
    },
}

/// Extracts network and transport endpoints from one frame.
///
/// Layers that are absent or not IP/TCP/UDP are left as `None`. Only a
/// frame whose headers cannot be read at all is an error.
pub fn decode_frame(link: LinkLayer, data: &[u8]) -> Result<Endpoints, DecodeError> {
    let sliced = match link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(data),
        LinkLayer::RawIp => SlicedPacket::from_ip(data),
    }
    .map_err(|source| DecodeError::Malformed { link, source })?;

    let network = match &sliced.ip {
        Some(InternetSlice::Ipv4(h, _)) => Some(NetworkPair {
            src: IpAddr::V4(h.source_addr()),
            dst: IpAddr::V4(h.destination_addr()),
        }),
        Some(InternetSlice::Ipv6(h, _)) => Some(NetworkPair {
            src: IpAddr::V6(h.source_addr()),
            dst: IpAddr::V6(h.destination_addr()),
        }),
        None => None,
    };

    let transport = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(PortPair {
            src: tcp.source_port(),
            dst: tcp.destination_port(),
        }),
        Some(TransportSlice::Udp(udp)) => Some(PortPair {
            src: udp.source_port(),
            dst: udp.destination_port(),
        }),
        _ => None,
    };

    Ok(Endpoints { network, transport })
}
