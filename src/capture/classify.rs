use std::net::IpAddr;

use super::PacketEvent;
use crate::sink::cache::{Direction, FlowKey};

/// Derives flow identity from a packet and the capture device's address.
///
/// The local address is resolved once at startup and never re-queried.
#[derive(Debug, Clone, Copy)]
pub struct FlowClassifier {
    local: IpAddr,
}

impl FlowClassifier {
    pub fn new(local: IpAddr) -> Self {
        Self { local }
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    /// Packets sent from the local address are uploads keyed by their
    /// destination; everything else is a download keyed by its source.
    /// Without both network and transport endpoints the flow is unknown.
    pub fn classify(&self, packet: &PacketEvent) -> FlowKey {
        let (Some(net), Some(ports)) = (packet.endpoints.network, packet.endpoints.transport)
        else {
            return FlowKey::unknown();
        };

        if net.src == self.local {
            FlowKey {
                direction: Direction::Upload,
                peer_ip: Some(net.dst),
                peer_port: Some(ports.dst),
            }
        } else {
            FlowKey {
                direction: Direction::Download,
                peer_ip: Some(net.src),
                peer_port: Some(ports.src),
            }
        }
    }
}
