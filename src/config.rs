use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flowtally agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Packet source configuration.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Bucket file location and naming.
    #[serde(default)]
    pub output: OutputConfig,

    /// Periodic cache flush configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Periodic summary report configuration.
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Capacity of the queue between the capture thread and the sink.
    /// Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Packet source configuration.
#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    /// Capture device name. When unset and no replay file is given, the
    /// device is chosen interactively.
    #[serde(default)]
    pub device: Option<String>,

    /// Read packets from this pcap file instead of a live device.
    #[serde(default)]
    pub replay_file: Option<PathBuf>,

    /// Overrides the local address used to classify direction.
    #[serde(default)]
    pub local_address: Option<String>,

    /// Bytes captured per packet. Default: 1024.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Capture in promiscuous mode. Default: false.
    #[serde(default)]
    pub promiscuous: bool,

    /// How long a live read blocks before checking for shutdown.
    /// Default: 500ms.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// Bucket file location and naming.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Directory holding bucket files. Default: "logs".
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// File name prefix, e.g. `results` gives `results-2024-05-01-14.csv`.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

/// Periodic cache flush configuration.
#[derive(Debug, Deserialize)]
pub struct FlushConfig {
    /// Time between flushes. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Extra attempts for a failed batch write. Default: 2.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

/// Periodic summary report configuration.
#[derive(Debug, Deserialize)]
pub struct SummaryConfig {
    /// Time between summaries of the open bucket. Default: 1h.
    #[serde(default = "default_summary_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Peers listed in each report. Default: 5.
    #[serde(default = "default_top_peers")]
    pub top_peers: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    65_536
}

fn default_snaplen() -> i32 {
    1024
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_file_prefix() -> String {
    "results".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_write_retries() -> u32 {
    2
}

fn default_summary_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_top_peers() -> usize {
    5
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            capture: CaptureConfig::default(),
            output: OutputConfig::default(),
            flush: FlushConfig::default(),
            summary: SummaryConfig::default(),
            channel_capacity: default_channel_capacity(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            replay_file: None,
            local_address: None,
            snaplen: default_snaplen(),
            promiscuous: false,
            read_timeout: default_read_timeout(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
            write_retries: default_write_retries(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            interval: default_summary_interval(),
            top_peers: default_top_peers(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The result is not validated: command-line overrides are applied
    /// first, and [`validate`](Self::validate) runs on the merged config.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Captures live from `device`, replacing any configured replay file.
    pub fn use_device(&mut self, device: String) {
        self.capture.device = Some(device);
        self.capture.replay_file = None;
    }

    /// Replays `path`, replacing any configured capture device.
    pub fn use_replay(&mut self, path: PathBuf) {
        self.capture.replay_file = Some(path);
        self.capture.device = None;
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        if self.summary.interval.is_zero() {
            bail!("summary.interval must be positive");
        }

        if self.summary.top_peers == 0 {
            bail!("summary.top_peers must be positive");
        }

        if self.capture.snaplen <= 0 {
            bail!("capture.snaplen must be positive");
        }

        if self.capture.device.is_some() && self.capture.replay_file.is_some() {
            bail!("capture.device and capture.replay_file are mutually exclusive");
        }

        if self.output.file_prefix.is_empty() {
            bail!("output.file_prefix is required");
        }

        self.local_address()?;

        Ok(())
    }

    /// Parsed `capture.local_address`, if set.
    pub fn local_address(&self) -> Result<Option<IpAddr>> {
        self.capture
            .local_address
            .as_deref()
            .map(|raw| {
                raw.parse::<IpAddr>()
                    .with_context(|| format!("invalid capture.local_address {raw:?}"))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.output.dir, PathBuf::from("logs"));
        assert_eq!(cfg.output.file_prefix, "results");
        assert_eq!(cfg.flush.interval, Duration::from_secs(5));
        assert_eq!(cfg.flush.write_retries, 2);
        assert_eq!(cfg.summary.interval, Duration::from_secs(3600));
        assert_eq!(cfg.summary.top_peers, 5);
        assert_eq!(cfg.capture.snaplen, 1024);
        assert!(!cfg.capture.promiscuous);
        assert_eq!(cfg.channel_capacity, 65_536);
        assert!(!cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing_with_durations() {
        let yaml = r#"
log_level: debug
capture:
  device: eth0
  local_address: 192.168.1.10
output:
  dir: /var/lib/flowtally
flush:
  interval: 10s
summary:
  interval: 30m
  top_peers: 3
health:
  enabled: true
  addr: "127.0.0.1:9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.capture.device.as_deref(), Some("eth0"));
        assert_eq!(cfg.output.dir, PathBuf::from("/var/lib/flowtally"));
        assert_eq!(cfg.output.file_prefix, "results");
        assert_eq!(cfg.flush.interval, Duration::from_secs(10));
        assert_eq!(cfg.summary.interval, Duration::from_secs(1800));
        assert_eq!(cfg.summary.top_peers, 3);
        assert!(cfg.health.enabled);
        assert_eq!(
            cfg.local_address().expect("address"),
            Some("192.168.1.10".parse().expect("ip"))
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_flush_interval() {
        let mut cfg = Config::default();
        cfg.flush.interval = Duration::ZERO;
        let err = cfg.validate().expect_err("zero interval");
        assert!(err.to_string().contains("flush.interval"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity_and_peers() {
        let mut cfg = Config::default();
        cfg.channel_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.summary.top_peers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.capture.snaplen = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_device_with_replay() {
        let mut cfg = Config::default();
        cfg.capture.device = Some("eth0".to_string());
        cfg.capture.replay_file = Some(PathBuf::from("trace.pcap"));
        let err = cfg.validate().expect_err("both sources");
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_rejects_bad_local_address() {
        let mut cfg = Config::default();
        cfg.capture.local_address = Some("not-an-ip".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_has_context() {
        let err = Config::load(Path::new("/nonexistent/flowtally.yaml")).expect_err("missing");
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_cli_source_override_resolves_file_conflict() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("flowtally.yaml");
        std::fs::write(
            &path,
            "capture:\n  device: eth0\n  replay_file: old.pcap\n  local_address: 10.0.0.1\n",
        )
        .expect("write config");

        let mut cfg = Config::load(&path).expect("load does not validate");
        assert!(cfg.validate().is_err());

        cfg.use_replay(PathBuf::from("trace.pcap"));
        cfg.validate().expect("override leaves one source");
        assert!(cfg.capture.device.is_none());
        assert_eq!(cfg.capture.replay_file, Some(PathBuf::from("trace.pcap")));

        cfg.use_device("eth1".to_string());
        cfg.validate().expect("override leaves one source");
        assert!(cfg.capture.replay_file.is_none());
    }
}
