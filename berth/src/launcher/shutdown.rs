//! Stop requests.
//!
//! The first request stops accepting and drains in-flight connections within
//! the grace period. A second request skips the drain.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable handle used to stop a running container.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting and drain.
    pub fn request(&self) {
        self.graceful.cancel();
    }

    /// Abort in-flight connections immediately.
    pub fn force(&self) {
        self.graceful.cancel();
        self.forced.cancel();
    }

    /// Escalate: the first call drains, any later call forces.
    pub fn escalate(&self) {
        if self.is_requested() {
            tracing::warn!("Second stop request, aborting in-flight connections");
            self.force();
        } else {
            tracing::info!("Stop requested, draining connections");
            self.request();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    pub async fn requested(&self) {
        self.graceful.cancelled().await
    }

    pub async fn forced(&self) {
        self.forced.cancelled().await
    }
}

/// Escalate `handle` on SIGTERM and SIGINT.
pub fn install_signal_handlers(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = terminate.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                received = interrupt.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            handle.escalate();
            if handle.is_forced() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_escalation() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_requested());

        handle.escalate();
        handle.requested().await;
        assert!(!handle.is_forced());

        handle.clone().escalate();
        handle.forced().await;
        assert!(handle.is_forced());
    }
}
