use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Turns the first SIGINT or SIGTERM into a cancellation of the shared token.
///
/// The token is cancelled at most once; later signals are not observed.
pub struct ShutdownSignal {
    cancel: CancellationToken,
}

impl ShutdownSignal {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Spawns the listener. It also exits when the token is cancelled by
    /// something else, such as the end of a replay.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let signal = tokio::select! {
                _ = self.cancel.cancelled() => return,
                signal = wait_for_signal() => signal,
            };

            info!(signal, "received termination signal, shutting down");
            self.cancel.cancel();
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler, listening for SIGINT only");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        signal = wait_for_ctrl_c() => signal,
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for SIGINT");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
