//! Subscriber registry and chunked fan-out
//!
//! Tracks every live subscriber connection behind one lock and enforces the
//! connection ceiling at admission. A broadcast takes a copy of the current
//! membership, sends to fixed-size chunks concurrently with a per-send
//! timeout, and evicts every subscriber whose send failed or timed out once
//! all chunks have completed.
//!
//! Sends within a chunk target disjoint subscribers, so the fan-out itself
//! holds no lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::{RegistryError, SendError};
use crate::metrics::ServiceMetrics;

/// Unique subscriber identifier.
pub type SubscriberId = u64;

/// A connected consumer of snapshots.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Deliver one serialized message.
    async fn send(&self, payload: Bytes) -> Result<(), SendError>;

    /// Called once after the registry drops this subscriber.
    fn detach(&self) {}
}

/// Outcome of one broadcast cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<SubscriberId>,
}

/// Configuration for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_connections: usize,
    pub chunk_size: usize,
    pub send_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for RegistryConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            chunk_size: config.broadcast_chunk_size,
            send_timeout: config.send_timeout,
        }
    }
}

struct Members {
    subscribers: BTreeMap<SubscriberId, Arc<dyn Subscriber>>,
    next_id: SubscriberId,
}

/// Registry of live subscribers.
pub struct SubscriberRegistry {
    members: Mutex<Members>,
    config: RegistryConfig,
    metrics: Arc<ServiceMetrics>,
}

impl SubscriberRegistry {
    pub fn new(config: RegistryConfig, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            members: Mutex::new(Members {
                subscribers: BTreeMap::new(),
                next_id: 1,
            }),
            config,
            metrics,
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a subscriber unless the ceiling is reached.
    pub fn connect(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, RegistryError> {
        let mut members = self.members();
        if members.subscribers.len() >= self.config.max_connections {
            drop(members);
            self.metrics.record_rejected_connection();
            warn!(
                capacity = self.config.max_connections,
                "Rejecting subscriber: registry at capacity"
            );
            return Err(RegistryError::AtCapacity {
                capacity: self.config.max_connections,
            });
        }

        let id = members.next_id;
        members.next_id += 1;
        members.subscribers.insert(id, subscriber);
        let count = members.subscribers.len();
        drop(members);

        self.metrics.set_connected_subscribers(count);
        debug!(subscriber_id = id, subscribers = count, "Subscriber connected");
        Ok(id)
    }

    /// Remove a subscriber and detach it. Unknown ids are ignored.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let mut members = self.members();
        let removed = members.subscribers.remove(&id);
        let count = members.subscribers.len();
        drop(members);

        match removed {
            Some(subscriber) => {
                subscriber.detach();
                self.metrics.set_connected_subscribers(count);
                debug!(subscriber_id = id, subscribers = count, "Subscriber disconnected");
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.members().subscribers.len()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members().subscribers.contains_key(&id)
    }

    /// Send `payload` to every current subscriber and evict the failures.
    pub async fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let targets: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .members()
            .subscribers
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let started = Instant::now();
        let mut report = BroadcastReport::default();

        for chunk in targets.chunks(self.config.chunk_size.max(1)) {
            let sends = chunk.iter().map(|(id, subscriber)| {
                let payload = payload.clone();
                async move {
                    let result = timeout(self.config.send_timeout, subscriber.send(payload)).await;
                    (*id, result)
                }
            });

            for (id, result) in join_all(sends).await {
                match result {
                    Ok(Ok(())) => report.delivered += 1,
                    Ok(Err(e)) => {
                        debug!(subscriber_id = id, error = %e, "Send failed");
                        report.evicted.push(id);
                    }
                    Err(_) => {
                        debug!(subscriber_id = id, "Send timed out");
                        report.evicted.push(id);
                    }
                }
            }
        }

        for id in &report.evicted {
            self.disconnect(*id);
        }
        if !report.evicted.is_empty() {
            warn!(
                evicted = report.evicted.len(),
                delivered = report.delivered,
                "Evicted failing subscribers"
            );
        }

        self.metrics.record_broadcast(
            started.elapsed().as_micros() as u64,
            report.evicted.len(),
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// How a test subscriber reacts to a send.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behavior {
        Healthy,
        Failing,
        Hanging,
    }

    /// In-memory subscriber that records what it receives.
    pub struct RecordingSubscriber {
        behavior: Behavior,
        received: Mutex<Vec<Bytes>>,
        attempts: AtomicUsize,
        detached: AtomicUsize,
    }

    impl RecordingSubscriber {
        pub fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                received: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                detached: AtomicUsize::new(0),
            })
        }

        pub fn received(&self) -> Vec<Bytes> {
            self.received.lock().unwrap().clone()
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn detached(&self) -> usize {
            self.detached.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn send(&self, payload: Bytes) -> Result<(), SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Healthy => {
                    self.received.lock().unwrap().push(payload);
                    Ok(())
                }
                Behavior::Failing => Err(SendError::Closed),
                Behavior::Hanging => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Behavior, RecordingSubscriber};
    use super::*;

    fn registry(max_connections: usize) -> SubscriberRegistry {
        SubscriberRegistry::new(
            RegistryConfig {
                max_connections,
                chunk_size: 50,
                send_timeout: Duration::from_secs(5),
            },
            Arc::new(ServiceMetrics::new()),
        )
    }

    #[test]
    fn test_connect_assigns_unique_ids() {
        let reg = registry(10);
        let a = reg.connect(RecordingSubscriber::new(Behavior::Healthy)).unwrap();
        let b = reg.connect(RecordingSubscriber::new(Behavior::Healthy)).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn test_admission_refused_at_capacity() {
        let reg = registry(500);
        for _ in 0..500 {
            reg.connect(RecordingSubscriber::new(Behavior::Healthy)).unwrap();
        }

        let result = reg.connect(RecordingSubscriber::new(Behavior::Healthy));
        assert_eq!(result, Err(RegistryError::AtCapacity { capacity: 500 }));
        assert_eq!(reg.count(), 500);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let reg = registry(10);
        let id = reg.connect(RecordingSubscriber::new(Behavior::Healthy)).unwrap();
        assert!(reg.disconnect(id));
        assert!(!reg.disconnect(id));
        assert!(!reg.disconnect(9999));
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_chunks() {
        let reg = registry(500);
        let subs: Vec<_> = (0..120)
            .map(|_| {
                let s = RecordingSubscriber::new(Behavior::Healthy);
                reg.connect(s.clone()).unwrap();
                s
            })
            .collect();

        let report = reg.broadcast(Bytes::from_static(b"{\"x\":1}")).await;

        assert_eq!(report.delivered, 120);
        assert!(report.evicted.is_empty());
        assert!(subs.iter().all(|s| s.received() == vec![Bytes::from_static(b"{\"x\":1}")]));
    }

    #[tokio::test]
    async fn test_failing_subscriber_evicted() {
        let reg = registry(10);
        let good = RecordingSubscriber::new(Behavior::Healthy);
        let bad = RecordingSubscriber::new(Behavior::Failing);
        let good_id = reg.connect(good.clone()).unwrap();
        let bad_id = reg.connect(bad.clone()).unwrap();

        let report = reg.broadcast(Bytes::from_static(b"a")).await;

        assert_eq!(report.evicted, vec![bad_id]);
        assert!(reg.contains(good_id));
        assert!(!reg.contains(bad_id));

        // Evicted subscribers are not retried
        reg.broadcast(Bytes::from_static(b"b")).await;
        assert_eq!(bad.attempts(), 1);
        assert_eq!(good.received().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_subscriber_times_out_without_stalling_others() {
        let reg = registry(10);
        let good = RecordingSubscriber::new(Behavior::Healthy);
        let hung = RecordingSubscriber::new(Behavior::Hanging);
        reg.connect(good.clone()).unwrap();
        let hung_id = reg.connect(hung).unwrap();

        let started = Instant::now();
        let report = reg.broadcast(Bytes::from_static(b"a")).await;

        assert_eq!(report.evicted, vec![hung_id]);
        assert_eq!(good.received().len(), 1);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(reg.count(), 1);
    }

    #[tokio::test]
    async fn test_removed_subscribers_detached_once() {
        let reg = registry(10);
        let left = RecordingSubscriber::new(Behavior::Healthy);
        let bad = RecordingSubscriber::new(Behavior::Failing);
        let stays = RecordingSubscriber::new(Behavior::Healthy);
        let left_id = reg.connect(left.clone()).unwrap();
        reg.connect(bad.clone()).unwrap();
        reg.connect(stays.clone()).unwrap();

        reg.disconnect(left_id);
        reg.disconnect(left_id);
        reg.broadcast(Bytes::from_static(b"a")).await;

        assert_eq!(left.detached(), 1);
        assert_eq!(bad.detached(), 1);
        assert_eq!(stays.detached(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_registry() {
        let reg = registry(10);
        assert_eq!(reg.broadcast(Bytes::new()).await, BroadcastReport::default());
    }
}
