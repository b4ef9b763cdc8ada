use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Process-wide request to stop, carrying the exit status to leave with.
///
/// The first requested status wins; later requests only cancel the token
/// again.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    exit_code: Arc<AtomicI32>,
}

const UNSET: i32 = i32::MIN;

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            exit_code: Arc::new(AtomicI32::new(UNSET)),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    pub fn request_exit(&self, code: i32) {
        let _ = self
            .exit_code
            .compare_exchange(UNSET, code, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Status to exit with; zero when nothing else was requested.
    pub fn exit_code(&self) -> i32 {
        match self.exit_code.load(Ordering::SeqCst) {
            UNSET => 0,
            code => code,
        }
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a [`Shutdown`] that is triggered with exit status 0 when either
/// signal is received.
pub fn install_shutdown_handler() -> std::io::Result<Shutdown> {
    let shutdown = Shutdown::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let handle = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        handle.request_exit(0);
    });

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_exit_code_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());
        assert_eq!(shutdown.exit_code(), 0);

        shutdown.request_exit(12);
        shutdown.request_exit(0);
        assert!(shutdown.is_requested());
        assert_eq!(shutdown.exit_code(), 12);
    }
}
