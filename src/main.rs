use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flowtally::agent::Agent;
use flowtally::config::Config;
use flowtally::signal::ShutdownSignal;
use flowtally::sink::summary::SummaryReporter;

/// Aggregates captured traffic into hourly per-flow CSV usage logs.
#[derive(Parser)]
#[command(name = "flowtally", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error); overrides
    /// log_level. Default: "info".
    #[arg(long)]
    log_level: Option<String>,

    /// Capture device name; overrides capture.device.
    #[arg(long, conflicts_with = "replay")]
    device: Option<String>,

    /// Replay this pcap file instead of capturing live; overrides capture.replay_file.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Directory for bucket files; overrides output.dir.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// List capture devices and exit.
    Devices,
    /// Print the summary report of a bucket file and exit.
    Summarize {
        /// Bucket file to scan.
        path: PathBuf,

        /// Number of peers to list.
        #[arg(long, default_value_t = 5)]
        top_peers: usize,
    },
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("flowtally {}", version::full());
        return Ok(());
    }

    match &cli.command {
        Some(Command::Devices) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            return list_devices();
        }
        Some(Command::Summarize { path, top_peers }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            if *top_peers == 0 {
                bail!("--top-peers must be positive");
            }
            return match SummaryReporter::new(*top_peers).report(path) {
                Some(_) => Ok(()),
                None => bail!("no summary produced for {}", path.display()),
            };
        }
        Some(Command::Version) | None => {}
    }

    let cfg = load_config(&cli)?;
    init_tracing(&cfg.log_level)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowtally",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

/// Loads the config file, if any, applies command-line overrides, then
/// validates the merged result.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }

    if let Some(device) = &cli.device {
        cfg.use_device(device.clone());
    }
    if let Some(replay) = &cli.replay {
        cfg.use_replay(replay.clone());
    }
    if let Some(dir) = &cli.output_dir {
        cfg.output.dir = dir.clone();
    }

    cfg.validate()?;

    Ok(cfg)
}

#[cfg(feature = "pcap")]
fn list_devices() -> Result<()> {
    use flowtally::capture::live;

    let devices = live::list_devices().context("listing capture devices")?;
    live::print_devices(&mut std::io::stdout().lock(), &devices)
        .context("printing capture devices")?;
    Ok(())
}

#[cfg(not(feature = "pcap"))]
fn list_devices() -> Result<()> {
    bail!("device listing requires the `pcap` feature")
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    let cancel = agent.cancel_token();

    // Set up signal handling.
    ShutdownSignal::new(cancel.clone()).spawn();

    // A failed start still runs the sink shutdown for anything recorded.
    if let Err(e) = agent.start().await {
        cancel.cancel();
        if let Err(stop_err) = agent.stop().await {
            tracing::error!(error = %stop_err, "error during shutdown");
        }
        return Err(e);
    }

    // Wait for a signal, the end of a replay, or a fatal error.
    cancel.cancelled().await;

    // Graceful shutdown.
    let report = agent.stop().await?;

    match report {
        Some(report) => tracing::info!(
            rows = report.rows_flushed,
            closed = ?report.closed_path,
            "flowtally stopped"
        ),
        None => tracing::info!("flowtally stopped"),
    }

    Ok(())
}
