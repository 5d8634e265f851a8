//! Background polling loops
//!
//! Each feed runs as one long-lived task: fetch, hand the result to the
//! history store, notify the coordinator on change and sleep. A failed fetch
//! replaces the poll interval with a capped linear backoff that resets on the
//! next success. Both loops observe cancellation at every await point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::coordinator::BroadcastCoordinator;
use crate::history::{HistoryStore, RecordOutcome};
use crate::metrics::ServiceMetrics;
use crate::sources::{PriceSource, RateSource};

/// Capped linear backoff: the n-th consecutive failure waits
/// `min(n × base, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    errors: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base: config.base,
            cap: config.cap,
            errors: 0,
        }
    }

    /// Register a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.errors = self.errors.saturating_add(1);
        self.base.saturating_mul(self.errors).min(self.cap)
    }

    /// Clear the failure streak, returning how long it was.
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.errors)
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}

/// Result of one fetch-and-apply step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// History changed; subscribers need a new snapshot.
    Changed,
    /// Fetch succeeded but nothing new was recorded.
    Unchanged,
    /// Fetch returned nothing.
    Failed,
}

/// One feed driven by a `Poller`.
#[async_trait]
pub trait Feed: Send {
    fn name(&self) -> &'static str;

    async fn poll_once(&mut self) -> PollOutcome;
}

/// Gold price feed.
pub struct PriceFeed {
    source: Arc<dyn PriceSource>,
    history: Arc<HistoryStore>,
    metrics: Arc<ServiceMetrics>,
}

impl PriceFeed {
    pub fn new(
        source: Arc<dyn PriceSource>,
        history: Arc<HistoryStore>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            source,
            history,
            metrics,
        }
    }
}

#[async_trait]
impl Feed for PriceFeed {
    fn name(&self) -> &'static str {
        "price"
    }

    async fn poll_once(&mut self) -> PollOutcome {
        let Some(quote) = self.source.fetch().await else {
            return PollOutcome::Failed;
        };
        match self.history.record_price(&quote) {
            RecordOutcome::Appended => {
                self.metrics.record_price_tick();
                PollOutcome::Changed
            }
            RecordOutcome::Duplicate => {
                self.metrics.record_duplicate();
                PollOutcome::Unchanged
            }
            RecordOutcome::Unchanged | RecordOutcome::Rejected => PollOutcome::Unchanged,
        }
    }
}

/// USD-IDR rate feed. Ticks are stamped with the wall clock at `offset`.
pub struct RateFeed {
    source: Arc<dyn RateSource>,
    history: Arc<HistoryStore>,
    metrics: Arc<ServiceMetrics>,
    offset: FixedOffset,
}

impl RateFeed {
    pub fn new(
        source: Arc<dyn RateSource>,
        history: Arc<HistoryStore>,
        metrics: Arc<ServiceMetrics>,
        utc_offset_hours: i32,
    ) -> Self {
        let offset = utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(utc_offset_hours, "Invalid UTC offset, stamping rate ticks in UTC");
                Utc.fix()
            });
        Self {
            source,
            history,
            metrics,
            offset,
        }
    }

    fn wall_clock(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%H:%M:%S")
            .to_string()
    }
}

#[async_trait]
impl Feed for RateFeed {
    fn name(&self) -> &'static str {
        "rate"
    }

    async fn poll_once(&mut self) -> PollOutcome {
        let Some(price) = self.source.fetch().await else {
            return PollOutcome::Failed;
        };
        match self.history.record_rate(&price, self.wall_clock()) {
            RecordOutcome::Appended => {
                self.metrics.record_rate_tick();
                PollOutcome::Changed
            }
            _ => PollOutcome::Unchanged,
        }
    }
}

/// Drives a feed at a fixed interval until cancelled.
pub struct Poller<F> {
    feed: F,
    interval: Duration,
    backoff: Backoff,
    coordinator: Arc<BroadcastCoordinator>,
    metrics: Arc<ServiceMetrics>,
}

impl<F: Feed> Poller<F> {
    pub fn new(
        feed: F,
        interval: Duration,
        backoff: BackoffConfig,
        coordinator: Arc<BroadcastCoordinator>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            feed,
            interval,
            backoff: Backoff::new(backoff),
            coordinator,
            metrics,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let feed = self.feed.name();
        info!(feed, interval_ms = self.interval.as_millis() as u64, "Poller started");

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.feed.poll_once() => outcome,
            };

            let delay = match outcome {
                PollOutcome::Failed => {
                    self.metrics.record_fetch_failure();
                    let delay = self.backoff.next_delay();
                    let errors = self.backoff.errors();
                    if errors == 1 {
                        warn!(feed, "Fetch failed, backing off");
                    } else {
                        debug!(feed, errors, delay_ms = delay.as_millis() as u64, "Fetch still failing");
                    }
                    delay
                }
                PollOutcome::Changed | PollOutcome::Unchanged => {
                    let errors = self.backoff.reset();
                    if errors > 0 {
                        info!(feed, errors, "Fetch recovered");
                    }
                    if outcome == PollOutcome::Changed {
                        self.coordinator.notify();
                    }
                    self.interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(feed, "Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use crate::history::RawPriceQuote;
    use crate::registry::{RegistryConfig, SubscriberRegistry};
    use crate::snapshot::SnapshotCache;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays scripted results and records when each fetch happened.
    struct ScriptedPrices {
        script: Mutex<VecDeque<Option<RawPriceQuote>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedPrices {
        fn new(script: Vec<Option<RawPriceQuote>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedPrices {
        async fn fetch(&self) -> Option<RawPriceQuote> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script.lock().unwrap().pop_front().flatten()
        }
    }

    struct FixedRate(&'static str);

    #[async_trait]
    impl RateSource for FixedRate {
        async fn fetch(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn quote(buy: &str, id: &str) -> RawPriceQuote {
        RawPriceQuote {
            buying_rate: Some(buy.to_string()),
            selling_rate: Some("900000".to_string()),
            updated_at: Some(id.to_string()),
        }
    }

    fn coordinator(history: Arc<HistoryStore>, metrics: Arc<ServiceMetrics>) -> Arc<BroadcastCoordinator> {
        let cache = Arc::new(SnapshotCache::new(
            history,
            Arc::new(Annotation::new()),
            metrics.clone(),
            Duration::from_millis(50),
        ));
        let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default(), metrics));
        Arc::new(BroadcastCoordinator::new(cache, registry, Duration::from_millis(8)))
    }

    #[test]
    fn test_backoff_grows_then_holds_at_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(300),
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [100, 200, 300, 300, 300].map(Duration::from_millis).to_vec()
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(backoff.reset(), 5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_poller_backs_off_and_recovers() {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::new(1441, 11, 5000));
        let source = ScriptedPrices::new(vec![
            None,
            None,
            None,
            None,
            None,
            Some(quote("1000000", "2024-01-01 10:00:00")),
        ]);
        let coordinator = coordinator(history.clone(), metrics.clone());

        let poller = Poller::new(
            PriceFeed::new(source.clone(), history.clone(), metrics.clone()),
            Duration::from_millis(20),
            BackoffConfig {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(300),
            },
            coordinator.clone(),
            metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1300)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = source.calls();
        let gaps: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            &gaps[..6],
            &[100, 200, 300, 300, 300, 20].map(Duration::from_millis)[..]
        );
        assert_eq!(history.price_len(), 1);
        assert_eq!(
            metrics.fetch_failures.load(std::sync::atomic::Ordering::Relaxed),
            5 + (calls.len() as u64 - 6)
        );
        assert!(coordinator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_update_ids_store_once() {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::new(1441, 11, 5000));
        let source = ScriptedPrices::new(vec![
            Some(quote("1000000", "U1")),
            Some(quote("1000000", "U1")),
        ]);
        let mut feed = PriceFeed::new(source, history.clone(), metrics.clone());

        assert_eq!(feed.poll_once().await, PollOutcome::Changed);
        assert_eq!(feed.poll_once().await, PollOutcome::Unchanged);
        assert_eq!(history.price_len(), 1);
        assert_eq!(
            metrics.duplicates_dropped.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_rate_feed_ignores_repeated_price() {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::new(1441, 11, 5000));
        let mut feed = RateFeed::new(Arc::new(FixedRate("16,250.50")), history.clone(), metrics, 7);

        assert_eq!(feed.poll_once().await, PollOutcome::Changed);
        for _ in 0..4 {
            assert_eq!(feed.poll_once().await, PollOutcome::Unchanged);
        }
        let rates = history.rate_view();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].time.len(), "HH:MM:SS".len());
    }

    #[test]
    fn test_rate_feed_rejects_out_of_range_offset() {
        let feed = RateFeed::new(
            Arc::new(FixedRate("1")),
            Arc::new(HistoryStore::new(1, 1, 1)),
            Arc::new(ServiceMetrics::new()),
            48,
        );
        assert_eq!(feed.offset, Utc.fix());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_on_cancel() {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::new(1441, 11, 5000));
        let poller = Poller::new(
            RateFeed::new(Arc::new(FixedRate("1")), history.clone(), metrics.clone(), 7),
            Duration::from_millis(300),
            BackoffConfig {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(10),
            },
            coordinator(history, metrics.clone()),
            metrics,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(1), handle)
            .await
            .expect("poller should exit promptly")
            .unwrap();
    }
}
