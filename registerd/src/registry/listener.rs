use std::sync::Arc;
use std::time::Duration;
use shared::protocol::SHUTDOWN_COMMAND;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::lifecycle::shutdown::{Shutdown, ShutdownReason};
use crate::registry::{Registry, RegistryError};

/// Watch the record's command field and trigger a graceful shutdown when the
/// shutdown command shows up. Stops after triggering or when cancelled.
pub async fn run(
    registry: Arc<Registry>,
    period: Duration,
    shutdown: Shutdown,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!("Listening for commands every {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.pending_command().await {
                    Ok(Some(command)) if command == SHUTDOWN_COMMAND => {
                        tracing::info!("Received remote shutdown command");
                        shutdown.trigger(ShutdownReason::RemoteCommand);
                        break;
                    }
                    Ok(Some(command)) => {
                        tracing::debug!("Ignoring unknown command '{}'", command);
                    }
                    Ok(None) => {}
                    Err(RegistryError::NotFound(id)) => {
                        tracing::warn!("Service record {} is missing from the directory", id);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read pending command: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Command listener stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{descriptor, directory, endpoint};

    const PERIOD: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_shutdown_command_triggers_once() {
        let directory = directory().await;
        let registry = Arc::new(Registry::new(directory.clone(), descriptor(), endpoint()));
        registry.register().await.unwrap();

        let shutdown = Shutdown::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry.clone(), PERIOD, shutdown.clone(), cancel.clone()));

        tokio::time::sleep(PERIOD * 3).await;
        assert!(shutdown.reason().is_none());

        directory
            .store()
            .await
            .unwrap()
            .set_service_command(registry.service_id(), Some(SHUTDOWN_COMMAND))
            .await
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .expect("Shutdown should be triggered by the remote command");
        assert_eq!(reason, ShutdownReason::RemoteCommand);

        // The listener stops by itself after triggering
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_commands_are_ignored() {
        let directory = directory().await;
        let registry = Arc::new(Registry::new(directory.clone(), descriptor(), endpoint()));
        registry.register().await.unwrap();
        directory
            .store()
            .await
            .unwrap()
            .set_service_command(registry.service_id(), Some("reload"))
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry, PERIOD, shutdown.clone(), cancel.clone()));

        tokio::time::sleep(PERIOD * 4).await;
        assert!(shutdown.reason().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_record_keeps_listening() {
        let registry = Arc::new(Registry::new(directory().await, descriptor(), endpoint()));
        let shutdown = Shutdown::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry, PERIOD, shutdown.clone(), cancel.clone()));

        tokio::time::sleep(PERIOD * 3).await;
        assert!(!handle.is_finished());
        assert!(shutdown.reason().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }
}
