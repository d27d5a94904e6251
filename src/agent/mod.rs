use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::capture::classify::FlowClassifier;
use crate::capture::replay::PcapFileSource;
use crate::capture::stats::PacketStats;
use crate::capture::{run_capture, CaptureEnd, PacketSource};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::shutdown::ShutdownReport;
use crate::sink::{FlowSink, SinkSettings};

/// Wires the packet source, the flow sink and the background reporters.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Option<FlowSink>,
    capture_task: Option<JoinHandle<Result<CaptureEnd>>>,
    packet_stats: Arc<PacketStats>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sink: None,
            capture_task: None,
            packet_stats: Arc::new(PacketStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Token cancelled when the agent must shut down, whether by signal, by
    /// the end of a replay, or by a fatal sink error.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Start all components and begin capturing.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Output directory.
        std::fs::create_dir_all(&self.cfg.output.dir).with_context(|| {
            format!(
                "creating output directory {}",
                self.cfg.output.dir.display()
            )
        })?;

        // 2. Packet source and the local address it is classified against.
        let (mut source, local) = self.open_source().await?;
        let classifier = FlowClassifier::new(local);
        info!(source = source.name(), local = %local, "packet source ready");

        // 3. Sink owns the rotator; it must run before packets flow.
        let mut sink = FlowSink::new(SinkSettings::from(&self.cfg), Arc::clone(&self.health));
        sink.start(self.cancel.clone())?;
        let sender = sink.sender();
        self.sink = Some(sink);

        // 4. Capture loop on a blocking thread.
        let stats = Arc::clone(&self.packet_stats);
        let cancel = self.cancel.clone();
        self.capture_task = Some(tokio::task::spawn_blocking(move || {
            let result = run_capture(source.as_mut(), &classifier, &sender, &stats, &cancel);

            match result {
                Ok(CaptureEnd::Exhausted) => {
                    info!("packet source exhausted, shutting down");
                    cancel.cancel();
                    Ok(CaptureEnd::Exhausted)
                }
                Ok(CaptureEnd::SinkClosed) => {
                    cancel.cancel();
                    Ok(CaptureEnd::SinkClosed)
                }
                Ok(end) => Ok(end),
                Err(e) => {
                    error!(error = %e, "capture failed");
                    cancel.cancel();
                    Err(e).context("capturing packets")
                }
            }
        }));

        // 5. Periodic stats.
        self.spawn_packet_stats_reporter();

        info!("agent started");

        Ok(())
    }

    /// Stops capture, runs the sink's shutdown sequence and waits for it.
    ///
    /// Returns the shutdown report, or the first fatal error raised by the
    /// sink or the capture loop.
    pub async fn stop(&mut self) -> Result<Option<ShutdownReport>> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for the sink's final flush, close and summary.
        let report = match &mut self.sink {
            Some(sink) => sink.wait_for_shutdown().await,
            None => Ok(None),
        };

        let captured = match self.capture_task.take() {
            Some(task) => task.await.context("capture task join failed")?,
            None => Ok(CaptureEnd::Cancelled),
        };

        // Stop health metrics server.
        self.health.stop().await?;

        let report = report?;
        let end = captured?;
        debug!(?end, "capture loop finished");

        Ok(report)
    }

    async fn open_source(&self) -> Result<(Box<dyn PacketSource>, IpAddr)> {
        let local_override = self.cfg.local_address()?;

        if let Some(path) = &self.cfg.capture.replay_file {
            let source = PcapFileSource::open(path)
                .with_context(|| format!("opening replay file {}", path.display()))?;
            let local = local_override
                .context("capture.local_address is required when replaying a capture file")?;
            return Ok((Box::new(source), local));
        }

        self.open_live(local_override).await
    }

    #[cfg(feature = "pcap")]
    async fn open_live(
        &self,
        local_override: Option<IpAddr>,
    ) -> Result<(Box<dyn PacketSource>, IpAddr)> {
        use crate::capture::live::{device_address, select_device, LiveSource};

        // Selection may prompt on stdin.
        let name = self.cfg.capture.device.clone();
        let device = tokio::task::spawn_blocking(move || select_device(name.as_deref()))
            .await
            .context("device selection task failed")?
            .context("selecting capture device")?;

        let local = match local_override {
            Some(local) => local,
            None => device_address(&device).context("resolving local address")?,
        };

        let source = LiveSource::open(device, &self.cfg.capture)
            .context("opening capture device")?;

        Ok((Box::new(source), local))
    }

    #[cfg(not(feature = "pcap"))]
    async fn open_live(
        &self,
        _local_override: Option<IpAddr>,
    ) -> Result<(Box<dyn PacketSource>, IpAddr)> {
        anyhow::bail!(
            "live capture requires the `pcap` feature; set capture.replay_file to replay a file"
        )
    }

    /// Spawn background packet stats reporter.
    fn spawn_packet_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let packet_stats = Arc::clone(&self.packet_stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = packet_stats.snapshot();
                        let packets: u64 = snapshot.iter().map(|c| c.packets).sum();

                        if packets == 0 {
                            continue;
                        }

                        let bytes: u64 = snapshot.iter().map(|c| c.bytes).sum();
                        info!(packets, bytes, "packet stats (60s)");

                        for count in &snapshot {
                            debug!(
                                direction = %count.direction,
                                packets = count.packets,
                                bytes = count.bytes,
                                "  by direction (60s)",
                            );
                        }
                    }
                }
            }
        });
    }
}
