use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use pcap::{Active, Capture, Device};
use tracing::{debug, info};

use super::decode::{decode_frame, LinkLayer};
use super::{CaptureError, PacketEvent, PacketSource, SourcePoll};
use crate::config::CaptureConfig;

/// A capture device as shown to the user.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub description: String,
    pub addresses: Vec<IpAddr>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name.clone(),
            description: device.desc.clone().unwrap_or_default(),
            addresses: device.addresses.iter().map(|a| a.addr).collect(),
        }
    }
}

fn all_devices() -> Result<Vec<Device>, CaptureError> {
    Device::list().map_err(|source| CaptureError::Live {
        device: "*".to_string(),
        source,
    })
}

/// Lists every device libpcap can capture on.
pub fn list_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    Ok(all_devices()?.iter().map(DeviceInfo::from).collect())
}

/// Writes the numbered device menu, one `[i] name - description` per line.
pub fn print_devices(out: &mut impl Write, devices: &[DeviceInfo]) -> std::io::Result<()> {
    writeln!(out, "Available Network Devices:")?;
    for (i, device) in devices.iter().enumerate() {
        writeln!(out, "[{i}] {} - {}", device.name, device.description)?;
    }
    Ok(())
}

/// Parses a menu answer into an index below `count`.
pub fn parse_selection(input: &str, count: usize) -> Result<usize, CaptureError> {
    let trimmed = input.trim();
    match trimmed.parse::<usize>() {
        Ok(index) if index < count => Ok(index),
        _ => Err(CaptureError::InvalidSelection(trimmed.to_string())),
    }
}

/// Picks the device named `name`, or asks on stdin when no name is given.
pub fn select_device(name: Option<&str>) -> Result<Device, CaptureError> {
    let devices = all_devices()?;

    if let Some(name) = name {
        return devices
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()));
    }

    let infos: Vec<DeviceInfo> = devices.iter().map(DeviceInfo::from).collect();
    let mut stdout = std::io::stdout().lock();
    let mut answer = String::new();
    let prompted = print_devices(&mut stdout, &infos)
        .and_then(|()| write!(stdout, "Select device by number: "))
        .and_then(|()| stdout.flush())
        .and_then(|()| std::io::stdin().lock().read_line(&mut answer));
    if prompted.is_err() {
        return Err(CaptureError::InvalidSelection(String::new()));
    }

    let index = parse_selection(&answer, devices.len())?;
    devices
        .into_iter()
        .nth(index)
        .ok_or_else(|| CaptureError::InvalidSelection(answer.trim().to_string()))
}

/// First address of `device`, used as the local side of every flow.
pub fn device_address(device: &Device) -> Result<IpAddr, CaptureError> {
    device
        .addresses
        .first()
        .map(|a| a.addr)
        .ok_or_else(|| CaptureError::NoAddress(device.name.clone()))
}

/// Live capture from a network device through libpcap.
pub struct LiveSource {
    name: String,
    link: LinkLayer,
    capture: Capture<Active>,
}

impl LiveSource {
    pub fn open(device: Device, cfg: &CaptureConfig) -> Result<Self, CaptureError> {
        let name = device.name.clone();
        let live_err = |source| CaptureError::Live {
            device: name.clone(),
            source,
        };

        let timeout_ms = i32::try_from(cfg.read_timeout.as_millis()).unwrap_or(i32::MAX);
        let capture = Capture::from_device(device)
            .map_err(live_err)?
            .promisc(cfg.promiscuous)
            .snaplen(cfg.snaplen)
            .timeout(timeout_ms)
            .open()
            .map_err(live_err)?;

        let linktype = capture.get_datalink();
        let link = u32::try_from(linktype.0)
            .ok()
            .and_then(LinkLayer::from_linktype)
            .ok_or_else(|| CaptureError::UnsupportedLink(format!("{linktype:?}")))?;

        info!(
            device = %name,
            snaplen = cfg.snaplen,
            promiscuous = cfg.promiscuous,
            ?link,
            "opened capture device"
        );

        Ok(Self {
            name,
            link,
            capture,
        })
    }
}

impl PacketSource for LiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_packet(&mut self) -> Result<SourcePoll, CaptureError> {
        let packet = match self.capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => return Ok(SourcePoll::Idle),
            Err(source) => {
                return Err(CaptureError::Live {
                    device: self.name.clone(),
                    source,
                })
            }
        };

        let ts = packet.header.ts;
        let timestamp = SystemTime::UNIX_EPOCH
            + Duration::from_secs(ts.tv_sec.max(0) as u64)
            + Duration::from_micros(ts.tv_usec.max(0) as u64);

        let endpoints = decode_frame(self.link, packet.data).unwrap_or_else(|e| {
            debug!(error = %e, "undecodable packet");
            Default::default()
        });

        Ok(SourcePoll::Packet(PacketEvent {
            timestamp,
            length: u64::from(packet.header.len),
            endpoints,
        }))
    }
}
