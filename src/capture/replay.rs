use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use tracing::{debug, info};

use super::decode::{decode_frame, LinkLayer};
use super::{CaptureError, PacketEvent, PacketSource, SourcePoll};

/// Replays packets from a pcap file, using the recorded timestamps.
pub struct PcapFileSource {
    name: String,
    path: PathBuf,
    link: LinkLayer,
    reader: PcapReader<BufReader<File>>,
    packets: u64,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path).map_err(|source| CaptureError::OpenFile {
            path: path.to_path_buf(),
            source,
        })?;

        let reader =
            PcapReader::new(BufReader::new(file)).map_err(|source| CaptureError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;

        let datalink = reader.header().datalink;
        let link = link_layer(datalink)
            .ok_or_else(|| CaptureError::UnsupportedLink(format!("{datalink:?}")))?;

        info!(path = %path.display(), ?link, "replaying capture file");

        Ok(Self {
            name: format!("replay:{}", path.display()),
            path: path.to_path_buf(),
            link,
            reader,
            packets: 0,
        })
    }
}

fn link_layer(datalink: DataLink) -> Option<LinkLayer> {
    match datalink {
        DataLink::ETHERNET => Some(LinkLayer::Ethernet),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Some(LinkLayer::RawIp),
        _ => None,
    }
}

impl PacketSource for PcapFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_packet(&mut self) -> Result<SourcePoll, CaptureError> {
        let packet = match self.reader.next_packet() {
            Some(Ok(packet)) => packet,
            Some(Err(source)) => {
                return Err(CaptureError::ReadFile {
                    path: self.path.clone(),
                    source,
                })
            }
            None => {
                info!(path = %self.path.display(), packets = self.packets, "capture file exhausted");
                return Ok(SourcePoll::Exhausted);
            }
        };

        self.packets += 1;

        let endpoints = decode_frame(self.link, &packet.data).unwrap_or_else(|e| {
            debug!(error = %e, packet = self.packets, "undecodable packet");
            Default::default()
        });

        Ok(SourcePoll::Packet(PacketEvent {
            timestamp: SystemTime::UNIX_EPOCH + packet.timestamp,
            length: u64::from(packet.orig_len),
            endpoints,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use etherparse::PacketBuilder;
    use pcap_file::pcap::{PcapPacket, PcapWriter};
    use tempfile::TempDir;

    use super::*;

    fn write_capture(path: &Path, frames: &[(Duration, Vec<u8>)]) {
        let file = File::create(path).expect("create pcap");
        let mut writer = PcapWriter::new(file).expect("pcap writer");
        for (ts, frame) in frames {
            let packet = PcapPacket::new(*ts, frame.len() as u32, frame);
            writer.write_packet(&packet).expect("write packet");
        }
    }

    fn udp_frame(src: [u8; 4], dst: [u8; 4], payload_len: usize) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4(src, dst, 64)
            .udp(40000, 53);
        let payload = vec![0u8; payload_len];
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).expect("build frame");
        frame
    }

    #[test]
    fn test_replay_yields_packets_then_exhausts() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("trace.pcap");
        let frame = udp_frame([10, 0, 0, 2], [8, 8, 8, 8], 20);
        let frame_len = frame.len() as u64;
        write_capture(
            &path,
            &[
                (Duration::from_secs(1_700_000_000), frame.clone()),
                (Duration::from_secs(1_700_000_001), frame),
            ],
        );

        let mut source = PcapFileSource::open(&path).expect("open");
        let SourcePoll::Packet(first) = source.next_packet().expect("first") else {
            panic!("expected a packet");
        };
        assert_eq!(first.length, frame_len);
        assert_eq!(
            first.timestamp.duration_since(SystemTime::UNIX_EPOCH).ok(),
            Some(Duration::from_secs(1_700_000_000))
        );
        let net = first.endpoints.network.expect("network layer");
        assert_eq!(net.dst, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(first.endpoints.transport.map(|p| p.dst), Some(53));

        assert!(matches!(
            source.next_packet().expect("second"),
            SourcePoll::Packet(_)
        ));
        assert!(matches!(
            source.next_packet().expect("end"),
            SourcePoll::Exhausted
        ));
    }

    #[test]
    fn test_undecodable_packet_still_counts_bytes() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("garbage.pcap");
        write_capture(&path, &[(Duration::from_secs(1), vec![0xff; 6])]);

        let mut source = PcapFileSource::open(&path).expect("open");
        let SourcePoll::Packet(packet) = source.next_packet().expect("packet") else {
            panic!("expected a packet");
        };
        assert_eq!(packet.length, 6);
        assert!(packet.endpoints.network.is_none());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().expect("tempdir");
        let err = PcapFileSource::open(&dir.path().join("missing.pcap"))
            .err()
            .expect("missing file");
        assert!(matches!(err, CaptureError::OpenFile { .. }));
    }
}
