//! Periodic liveness ping to every connected subscriber.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SubscriberRegistry;

pub const PING: &[u8] = br#"{"ping":true}"#;
pub const PONG: &[u8] = br#"{"pong":true}"#;

/// Broadcast `PING` every `interval` while anyone is connected. Never touches
/// the snapshot cache.
pub async fn run(registry: Arc<SubscriberRegistry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if registry.count() == 0 {
            continue;
        }
        let report = registry.broadcast(Bytes::from_static(PING)).await;
        debug!(delivered = report.delivered, evicted = report.evicted.len(), "Heartbeat sent");
    }

    info!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServiceMetrics;
    use crate::registry::testing::{Behavior, RecordingSubscriber};
    use crate::registry::RegistryConfig;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_connected_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new(
            RegistryConfig::default(),
            Arc::new(ServiceMetrics::new()),
        ));
        let sub = RecordingSubscriber::new(Behavior::Healthy);
        registry.connect(sub.clone()).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry.clone(), Duration::from_secs(15), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sub.received().is_empty());

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(sub.received(), vec![Bytes::from_static(PING); 2]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_evicts_dead_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new(
            RegistryConfig::default(),
            Arc::new(ServiceMetrics::new()),
        ));
        registry.connect(RecordingSubscriber::new(Behavior::Failing)).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry.clone(), Duration::from_secs(15), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(registry.count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
