//! Process-wide shutdown guard and termination signal handling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// Shutdown command found in the service record
    RemoteCommand,
    /// Startup failed before the service was fully up
    StartupFailure,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "termination signal"),
            ShutdownReason::RemoteCommand => write!(f, "remote shutdown command"),
            ShutdownReason::StartupFailure => write!(f, "startup failure"),
        }
    }
}

/// Shutdown trigger shared by the signal watcher and the command listener.
/// Only the first trigger takes effect.
#[derive(Clone)]
pub struct Shutdown {
    started: Arc<AtomicBool>,
    reason: Arc<OnceLock<ShutdownReason>>,
    token: CancellationToken,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(OnceLock::new()),
            token: CancellationToken::new(),
        }
    }

    /// Request shutdown. Returns `true` for the trigger that won.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Shutdown already in progress, ignoring {}", reason);
            return false;
        }

        let _ = self.reason.set(reason);
        tracing::info!("Shutdown requested by {}", reason);
        self.token.cancel();
        true
    }

    /// Reason of the winning trigger, once there is one
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Signal)
    }

    /// Token cancelled when shutdown is triggered, for tasks that should stop with it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }

    Ok(())
}

/// Forward termination signals into the shutdown guard
pub async fn watch_signals(shutdown: Shutdown) {
    tokio::select! {
        result = wait_for_signal() => match result {
            Ok(()) => {
                shutdown.trigger(ShutdownReason::Signal);
            }
            Err(e) => tracing::error!("Failed to listen for termination signals: {}", e),
        },
        _ = shutdown.token.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_trigger_wins() {
        let shutdown = Shutdown::new();

        assert!(shutdown.trigger(ShutdownReason::RemoteCommand));
        assert!(!shutdown.trigger(ShutdownReason::Signal));
        assert_eq!(shutdown.reason(), Some(ShutdownReason::RemoteCommand));
        assert!(shutdown.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_have_single_winner() {
        let shutdown = Shutdown::new();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let shutdown = shutdown.clone();
                let reason = if i % 2 == 0 {
                    ShutdownReason::Signal
                } else {
                    ShutdownReason::RemoteCommand
                };
                tokio::spawn(async move { shutdown.trigger(reason) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(shutdown.reason().is_some());
    }

    #[tokio::test]
    async fn test_triggered_resolves_with_reason() {
        let shutdown = Shutdown::new();
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.triggered().await }
        });

        shutdown.trigger(ShutdownReason::RemoteCommand);
        assert_eq!(waiter.await.unwrap(), ShutdownReason::RemoteCommand);
    }

    #[tokio::test]
    async fn test_signal_watcher_exits_when_shutdown_starts_elsewhere() {
        let shutdown = Shutdown::new();
        let watcher = tokio::spawn(watch_signals(shutdown.clone()));

        shutdown.trigger(ShutdownReason::RemoteCommand);
        watcher.await.unwrap();
        assert_eq!(shutdown.reason(), Some(ShutdownReason::RemoteCommand));
    }
}
