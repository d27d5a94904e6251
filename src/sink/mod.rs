pub mod cache;
pub mod flush;
pub mod record;
pub mod rotation;
pub mod shutdown;
pub mod summary;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;

use self::cache::{AggregationCache, Direction, FlowKey};
use self::flush::CacheFlusher;
use self::rotation::{LogRotator, RotationError};
use self::shutdown::{ShutdownCoordinator, ShutdownReport};
use self::summary::SummaryReporter;

/// Events drained from the queue per wakeup before yielding to the tickers.
const BATCH_SIZE: usize = 256;

/// A classified packet on its way to the aggregation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEvent {
    pub key: FlowKey,
    pub size: u64,
    /// Capture time; selects the bucket file.
    pub timestamp: SystemTime,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("flow sink is closed")]
pub struct SinkClosed;

/// Producer handle for the sink queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<FlowEvent>,
}

impl EventSender {
    /// Creates a bounded queue and its sending half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FlowEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Sends from a blocking thread, waiting while the queue is full.
    pub fn blocking_send(&self, event: FlowEvent) -> Result<(), SinkClosed> {
        self.tx.blocking_send(event).map_err(|_| SinkClosed)
    }

    /// Sends from async code, waiting while the queue is full.
    pub async fn send(&self, event: FlowEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Sink settings extracted from the agent configuration.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub flush_interval: Duration,
    pub write_retries: u32,
    pub summary_interval: Duration,
    pub top_peers: usize,
    pub channel_capacity: usize,
}

impl From<&Config> for SinkSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            output_dir: cfg.output.dir.clone(),
            file_prefix: cfg.output.file_prefix.clone(),
            flush_interval: cfg.flush.interval,
            write_retries: cfg.flush.write_retries,
            summary_interval: cfg.summary.interval,
            top_peers: cfg.summary.top_peers,
            channel_capacity: cfg.channel_capacity,
        }
    }
}

/// Owns the log rotator and serializes every operation on it.
///
/// Events, the flush ticker, the summary ticker and cancellation are all
/// handled by one spawned task, so bucket switches, flushes and the final
/// shutdown sequence never run concurrently.
pub struct FlowSink {
    settings: SinkSettings,
    health: Arc<HealthMetrics>,
    cache: Arc<AggregationCache>,
    sender: EventSender,
    event_rx: Option<mpsc::Receiver<FlowEvent>>,
    run_task: Option<JoinHandle<Result<ShutdownReport, RotationError>>>,
}

impl FlowSink {
    pub fn new(settings: SinkSettings, health: Arc<HealthMetrics>) -> Self {
        let (sender, event_rx) = EventSender::channel(settings.channel_capacity);

        Self {
            settings,
            health,
            cache: Arc::new(AggregationCache::new()),
            sender,
            event_rx: Some(event_rx),
            run_task: None,
        }
    }

    /// Returns the sink's name for logging.
    pub fn name(&self) -> &str {
        "flow"
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn cache(&self) -> Arc<AggregationCache> {
        Arc::clone(&self.cache)
    }

    /// Spawns the run loop. It exits after the shutdown sequence once `ctx`
    /// is cancelled, or cancels `ctx` itself on a fatal write error.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let event_rx = self
            .event_rx
            .take()
            .context("flow sink started more than once")?;

        let run = RunLoop {
            rotator: LogRotator::new(&self.settings.output_dir, &self.settings.file_prefix),
            cache: Arc::clone(&self.cache),
            flusher: CacheFlusher::new(self.settings.write_retries),
            reporter: SummaryReporter::new(self.settings.top_peers),
            health: Arc::clone(&self.health),
        };

        let flush_interval = self.settings.flush_interval;
        let summary_interval = self.settings.summary_interval;

        self.run_task = Some(tokio::spawn(run.run(
            event_rx,
            ctx,
            flush_interval,
            summary_interval,
        )));

        info!(
            sink = self.name(),
            dir = %self.settings.output_dir.display(),
            flush_interval = ?flush_interval,
            summary_interval = ?summary_interval,
            "sink started"
        );

        Ok(())
    }

    /// Waits for the run loop to finish.
    ///
    /// Returns `None` when the sink was never started.
    pub async fn wait_for_shutdown(&mut self) -> Result<Option<ShutdownReport>> {
        let Some(run_task) = self.run_task.take() else {
            return Ok(None);
        };

        let report = run_task
            .await
            .context("flow sink task join failed")?
            .context("flow sink failed")?;

        Ok(Some(report))
    }
}

struct RunLoop {
    rotator: LogRotator,
    cache: Arc<AggregationCache>,
    flusher: CacheFlusher,
    reporter: SummaryReporter,
    health: Arc<HealthMetrics>,
}

impl RunLoop {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<FlowEvent>,
        ctx: CancellationToken,
        flush_interval: Duration,
        summary_interval: Duration,
    ) -> Result<ShutdownReport, RotationError> {
        let mut flush_ticker = tokio::time::interval(flush_interval);
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut summary_ticker = tokio::time::interval(summary_interval);
        summary_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Consume the immediate first ticks so both fire one interval after start.
        flush_ticker.tick().await;
        summary_ticker.tick().await;

        let result = loop {
            tokio::select! {
                _ = ctx.cancelled() => break self.shutdown(&mut event_rx),

                Some(event) = event_rx.recv() => {
                    if let Err(e) = self.apply(event) {
                        break Err(e);
                    }

                    // Drain up to BATCH_SIZE-1 more events without blocking.
                    let mut failed = None;
                    for _ in 0..BATCH_SIZE - 1 {
                        let Ok(event) = event_rx.try_recv() else {
                            break;
                        };
                        if let Err(e) = self.apply(event) {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        break Err(e);
                    }
                }

                _ = flush_ticker.tick() => {
                    if let Err(e) = self.flush() {
                        break Err(e);
                    }
                }

                _ = summary_ticker.tick() => self.summarize(),
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "flow sink stopped on fatal error");
            ctx.cancel();
        }

        result
    }

    /// Switches buckets when needed and records the event.
    fn apply(&mut self, event: FlowEvent) -> Result<(), RotationError> {
        if self.rotator.ensure_bucket(event.timestamp)? {
            self.health.bucket_rotations.inc();
        }

        self.cache.record(event.key, event.size);

        self.health.packets_received.inc();
        if event.key.direction == Direction::Unknown {
            self.health.packets_unclassified.inc();
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), RotationError> {
        let started = Instant::now();
        let result = self
            .flusher
            .flush(&self.cache, &mut self.rotator, SystemTime::now());

        match result {
            Ok(outcome) => {
                if !outcome.skipped {
                    self.health.flushes.inc();
                    self.health.rows_written.inc_by(outcome.rows as f64);
                    self.health
                        .flush_duration
                        .observe(started.elapsed().as_secs_f64());
                }
                self.health.cache_entries.set(self.cache.len() as f64);
                debug!(rows = outcome.rows, skipped = outcome.skipped, "periodic flush");
                Ok(())
            }
            Err(e) => {
                self.health.flush_errors.inc();
                Err(e)
            }
        }
    }

    fn summarize(&self) {
        let Some(path) = self.rotator.current_path() else {
            debug!("no bucket open, skipping summary");
            return;
        };

        if self.reporter.report(path).is_some() {
            self.health.summaries.inc();
        }
    }

    /// Runs once on cancellation: queued events are recorded first, then the
    /// final flush, close and summary.
    fn shutdown(
        &mut self,
        event_rx: &mut mpsc::Receiver<FlowEvent>,
    ) -> Result<ShutdownReport, RotationError> {
        // Refuse new events, then take what is already queued.
        event_rx.close();
        let mut drained = 0usize;
        while let Ok(event) = event_rx.try_recv() {
            self.apply(event)?;
            drained += 1;
        }
        info!(drained, "shutting down flow sink");

        let coordinator = ShutdownCoordinator::new(
            &self.cache,
            &mut self.rotator,
            self.flusher,
            self.reporter,
        );
        let report = match coordinator.run(SystemTime::now()) {
            Ok(report) => report,
            Err(e) => {
                self.health.flush_errors.inc();
                return Err(e);
            }
        };

        self.health.rows_written.inc_by(report.rows_flushed as f64);
        self.health.cache_entries.set(self.cache.len() as f64);
        if report.summary.is_some() {
            self.health.summaries.inc();
        }

        Ok(report)
    }
}
