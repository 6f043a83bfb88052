use std::sync::Arc;
use std::time::Duration;
use shared::types::ServiceStatus;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::registry::Registry;

/// Republish `active` every `period` until cancelled.
/// Failed beats are logged, the next tick simply tries again. Cancellation
/// also abandons a beat that is still in flight.
pub async fn run(registry: Arc<Registry>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!("Heartbeat started with a period of {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A beat stuck on an unreachable store must not hold up shutdown
                tokio::select! {
                    result = registry.set_service_status(ServiceStatus::Active) => {
                        if let Err(e) = result {
                            tracing::warn!("Heartbeat failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Heartbeat stopped during a beat");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Heartbeat stopped");
                break;
            }
        }
    }
}
