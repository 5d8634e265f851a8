//! Aggregate snapshot building and caching
//!
//! A snapshot is the full dashboard state: formatted price history, rate
//! history and the operator annotation. It is never patched; every rebuild
//! supersedes the previous one wholesale.
//!
//! `SnapshotCache` keeps the serialized bytes of the last build for a short
//! freshness window. Readers that find fresh bytes return them without
//! touching the rebuild lock; a stale or invalidated cache is rebuilt by a
//! single caller while concurrent callers wait on the lock and then reuse
//! that result (double-checked).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::annotation::Annotation;
use crate::error::SnapshotError;
use crate::format::{profit_display, transaction_display, DisplayFormatter, PROFIT_TIERS};
use crate::history::{HistoryStore, PriceTick, RateTick};
use crate::metrics::ServiceMetrics;

/// One formatted row of the price history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItemView {
    #[serde(rename = "buying_rate")]
    pub buy_rate: String,
    #[serde(rename = "selling_rate")]
    pub sell_rate: String,
    #[serde(rename = "waktu_display")]
    pub time_display: String,
    pub diff_display: String,
    pub transaction_display: String,
    #[serde(rename = "created_at")]
    pub timestamp: String,
    pub jt20: String,
    pub jt30: String,
    pub jt40: String,
    pub jt50: String,
}

/// One rate history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateView {
    pub price: String,
    pub time: String,
}

/// Immutable aggregate state delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub history: Vec<HistoryItemView>,
    #[serde(rename = "usd_idr_history")]
    pub rate_history: Vec<RateView>,
    #[serde(rename = "treasury_info")]
    pub annotation: String,
}

impl AggregateSnapshot {
    /// Assemble a snapshot from copies of the current state.
    pub fn build(
        formatter: &mut DisplayFormatter,
        prices: &[PriceTick],
        rates: &[RateTick],
        annotation: String,
    ) -> Self {
        Self {
            history: prices
                .iter()
                .map(|tick| history_item(formatter, tick))
                .collect(),
            rate_history: rates
                .iter()
                .map(|r| RateView {
                    price: r.price.clone(),
                    time: r.time.clone(),
                })
                .collect(),
            annotation,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, SnapshotError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

fn history_item(formatter: &mut DisplayFormatter, tick: &PriceTick) -> HistoryItemView {
    let buy = formatter.rupiah(tick.buy_rate);
    let sell = formatter.rupiah(tick.sell_rate);
    let diff = formatter.diff(tick.diff, tick.status);
    let [jt20, jt30, jt40, jt50] = PROFIT_TIERS
        .map(|(capital, principal)| profit_display(tick.buy_rate, tick.sell_rate, capital, principal));

    HistoryItemView {
        time_display: format!("{}{}", formatter.day_time(&tick.timestamp), tick.status.marker()),
        transaction_display: transaction_display(&buy, &sell, &diff),
        buy_rate: buy,
        sell_rate: sell,
        diff_display: diff,
        timestamp: tick.timestamp.clone(),
        jt20,
        jt30,
        jt40,
        jt50,
    }
}

/// Hex SHA-256 of a serialized snapshot, used as its HTTP entity tag.
pub fn content_checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    bytes: Bytes,
    built_at: Instant,
    version: u64,
}

/// Cache of the serialized aggregate snapshot.
pub struct SnapshotCache {
    history: Arc<HistoryStore>,
    annotation: Arc<Annotation>,
    metrics: Arc<ServiceMetrics>,
    ttl: Duration,
    /// Bumped by every `invalidate`.
    version: AtomicU64,
    cached: RwLock<Option<CachedSnapshot>>,
    /// Serializes rebuilds; the formatter memo tables live behind it.
    rebuild: Mutex<DisplayFormatter>,
    rebuilds: AtomicU64,
}

impl SnapshotCache {
    pub fn new(
        history: Arc<HistoryStore>,
        annotation: Arc<Annotation>,
        metrics: Arc<ServiceMetrics>,
        ttl: Duration,
    ) -> Self {
        Self {
            history,
            annotation,
            metrics,
            ttl,
            version: AtomicU64::new(0),
            cached: RwLock::new(None),
            rebuild: Mutex::new(DisplayFormatter::new()),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Drop the cached bytes and bump the version. Never blocks on a rebuild.
    pub fn invalidate(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Current cache version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of rebuilds performed so far.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn fresh(&self, now: Instant) -> Option<Bytes> {
        let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
        cached
            .as_ref()
            .filter(|c| c.version == self.version() && now.duration_since(c.built_at) < self.ttl)
            .map(|c| c.bytes.clone())
    }

    /// Serialized snapshot, rebuilt at most once per freshness window.
    pub async fn get_snapshot_bytes(&self) -> Result<Bytes, SnapshotError> {
        if let Some(bytes) = self.fresh(Instant::now()) {
            return Ok(bytes);
        }

        let mut formatter = self.rebuild.lock().await;
        let now = Instant::now();
        if let Some(bytes) = self.fresh(now) {
            return Ok(bytes);
        }

        // Read the version before the state so a concurrent invalidation
        // makes this build stale rather than silently current.
        let version = self.version();
        let prices = self.history.price_view();
        let rates = self.history.rate_view();
        let snapshot =
            AggregateSnapshot::build(&mut formatter, &prices, &rates, self.annotation.current());
        let bytes = snapshot.to_bytes()?;

        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedSnapshot {
            bytes: bytes.clone(),
            built_at: now,
            version,
        });
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_snapshot();

        debug!(
            version,
            price_ticks = prices.len(),
            rate_ticks = rates.len(),
            size = bytes.len(),
            "Snapshot rebuilt"
        );
        Ok(bytes)
    }
}
