use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared shutdown signal for graceful termination
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token every loop selects on
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn initiate_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown initiated");
        }
        self.token.cancel();
    }

    /// Cancel the token on SIGINT or SIGTERM
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.token.cancelled() => {}
                received = wait_for_signal() => {
                    info!(signal = received, "Signal received, shutting down");
                    signal.initiate_shutdown();
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        name = ctrl_c() => name,
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initiate_shutdown_cancels_clones() {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        let clone = signal.clone();
        assert!(!clone.is_shutdown_requested());

        signal.initiate_shutdown();
        assert!(clone.is_shutdown_requested());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_signal_listener_stops_on_shutdown() {
        let signal = ShutdownSignal::new();
        let listener = signal.listen_for_signals();
        signal.initiate_shutdown();
        listener.await.expect("listener task");
    }
}
