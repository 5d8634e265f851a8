//! Change coalescing between state mutations and subscriber fan-out
//!
//! `notify()` is cheap and callable from any task. The first call of a burst
//! wins the pending flag, invalidates the snapshot cache and wakes the
//! coordinator task; later calls in the same window are no-ops. After the
//! debounce interval the task clears the flag, rebuilds once and broadcasts
//! the resulting snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SnapshotError;
use crate::registry::SubscriberRegistry;
use crate::snapshot::SnapshotCache;

pub struct BroadcastCoordinator {
    pending: AtomicBool,
    wake: Notify,
    cache: Arc<SnapshotCache>,
    registry: Arc<SubscriberRegistry>,
    debounce: Duration,
}

impl BroadcastCoordinator {
    pub fn new(
        cache: Arc<SnapshotCache>,
        registry: Arc<SubscriberRegistry>,
        debounce: Duration,
    ) -> Self {
        Self {
            pending: AtomicBool::new(false),
            wake: Notify::new(),
            cache,
            registry,
            debounce,
        }
    }

    /// Signal a state change. Returns `true` if this call scheduled a new
    /// cycle, `false` if one was already pending.
    pub fn notify(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.cache.invalidate();
        self.wake.notify_one();
        true
    }

    /// Whether a coalescing cycle is scheduled and has not yet fired.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Run coalescing cycles until cancelled.
    ///
    /// Only a snapshot serialization failure ends the loop early.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SnapshotError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }

            self.pending.store(false, Ordering::Release);
            // A reader may have rebuilt mid-window; never broadcast that.
            self.cache.invalidate();

            let bytes = self.cache.get_snapshot_bytes().await?;
            let report = self.registry.broadcast(bytes).await;
            debug!(
                delivered = report.delivered,
                evicted = report.evicted.len(),
                "Coalesced snapshot broadcast"
            );
        }

        info!("Broadcast coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use crate::history::{HistoryStore, RawPriceQuote};
    use crate::metrics::ServiceMetrics;
    use crate::registry::testing::{Behavior, RecordingSubscriber};
    use crate::registry::RegistryConfig;

    struct Harness {
        history: Arc<HistoryStore>,
        annotation: Arc<Annotation>,
        coordinator: Arc<BroadcastCoordinator>,
        subscriber: Arc<RecordingSubscriber>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::new(1441, 11, 5000));
        let annotation = Arc::new(Annotation::new());
        let cache = Arc::new(SnapshotCache::new(
            history.clone(),
            annotation.clone(),
            metrics.clone(),
            Duration::from_millis(50),
        ));
        let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default(), metrics));
        let subscriber = RecordingSubscriber::new(Behavior::Healthy);
        registry.connect(subscriber.clone()).unwrap();

        let coordinator = Arc::new(BroadcastCoordinator::new(
            cache,
            registry,
            Duration::from_millis(8),
        ));
        let cancel = CancellationToken::new();
        let task = coordinator.clone();
        let token = cancel.clone();
        tokio::spawn(async move { task.run(token).await });

        Harness {
            history,
            annotation,
            coordinator,
            subscriber,
            cancel,
        }
    }

    fn quote(buy: &str, id: &str) -> RawPriceQuote {
        RawPriceQuote {
            buying_rate: Some(buy.to_string()),
            selling_rate: Some("900000".to_string()),
            updated_at: Some(id.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_broadcasts_once_with_final_state() {
        let h = harness();

        h.history.record_price(&quote("1000000", "2024-01-01 10:00:00"));
        assert!(h.coordinator.notify());
        tokio::time::sleep(Duration::from_millis(2)).await;

        h.history.record_price(&quote("1050000", "2024-01-01 10:01:00"));
        assert!(!h.coordinator.notify());
        tokio::time::sleep(Duration::from_millis(2)).await;

        h.annotation.replace("final");
        assert!(!h.coordinator.notify());
        assert!(h.coordinator.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = h.subscriber.received();
        assert_eq!(received.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&received[0]).unwrap();
        assert_eq!(json["treasury_info"], "final");
        assert_eq!(json["history"].as_array().unwrap().len(), 2);
        assert!(!h.coordinator.is_pending());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_broadcast_separately() {
        let h = harness();

        h.annotation.replace("one");
        h.coordinator.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.annotation.replace("two");
        h.coordinator.notify();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let received = h.subscriber.received();
        assert_eq!(received.len(), 2);
        let last: serde_json::Value = serde_json::from_slice(&received[1]).unwrap();
        assert_eq!(last["treasury_info"], "two");
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_broadcast_without_notify() {
        let h = harness();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.subscriber.received().is_empty());
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_on_cancel() {
        let metrics = Arc::new(ServiceMetrics::new());
        let cache = Arc::new(SnapshotCache::new(
            Arc::new(HistoryStore::new(10, 10, 10)),
            Arc::new(Annotation::new()),
            metrics.clone(),
            Duration::from_millis(50),
        ));
        let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default(), metrics));
        let coordinator = BroadcastCoordinator::new(cache, registry, Duration::from_millis(8));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(coordinator.run(cancel).await.is_ok());
    }
}
