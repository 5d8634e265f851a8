//! Bounded rolling history of price and rate ticks
//!
//! Each feed appends at the tail of a fixed-capacity window and the oldest
//! tick falls off the front once the capacity is exceeded. Price updates are
//! deduplicated by the upstream revision id and carry a status/diff derived
//! from the immediately preceding buy rate only.
//!
//! Writes come from exactly one poller per feed. Snapshot building reads a
//! copy of the window, so the locks below are only ever contended by one
//! writer and the occasional reader.

use std::collections::{HashSet, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServiceConfig;

/// Direction of a price tick relative to the previous buy rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickStatus {
    Up,
    Down,
    Flat,
}

impl TickStatus {
    /// Derive the status of `current` against the previous buy rate.
    /// No previous value is `Flat`.
    pub fn from_change(previous: Option<i64>, current: i64) -> Self {
        match previous {
            Some(prev) if current > prev => TickStatus::Up,
            Some(prev) if current < prev => TickStatus::Down,
            _ => TickStatus::Flat,
        }
    }

    /// Display marker used by the dashboard.
    pub fn marker(&self) -> &'static str {
        match self {
            TickStatus::Up => "🚀",
            TickStatus::Down => "🔻",
            TickStatus::Flat => "➖",
        }
    }
}

/// One accepted observation from the price source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub buy_rate: i64,
    pub sell_rate: i64,
    pub status: TickStatus,
    /// `buy_rate` minus the previous buy rate, 0 for the first tick.
    pub diff: i64,
    /// Upstream revision identifier.
    pub source_update_id: String,
    /// Source-provided wall-clock timestamp.
    pub timestamp: String,
}

/// One accepted observation from the exchange-rate source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTick {
    /// Source-formatted price text.
    pub price: String,
    /// Local wall-clock time (HH:MM:SS) at which the tick was recorded.
    pub time: String,
}

/// Unvalidated price quote as handed over by the price source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPriceQuote {
    pub buying_rate: Option<String>,
    pub selling_rate: Option<String>,
    pub updated_at: Option<String>,
}

/// Result of offering a tick to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Appended to the window; subscribers need a new snapshot.
    Appended,
    /// Upstream revision already seen.
    Duplicate,
    /// Same value as the most recent tick.
    Unchanged,
    /// Required field missing or non-numeric.
    Rejected,
}

impl RecordOutcome {
    /// Whether the store changed and the coordinator must be notified.
    pub fn is_changed(&self) -> bool {
        matches!(self, RecordOutcome::Appended)
    }
}

/// Fixed-capacity, insertion-ordered sequence. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct HistoryWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> HistoryWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail, returning the evicted head if the window was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the window, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Bounded set of recently seen revision ids.
///
/// Once the cap is exceeded the oldest remembered id is forgotten, so only an
/// id older than the last `capacity` distinct ids can be accepted again.
#[derive(Debug, Clone)]
pub struct DedupSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Remember `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Price-side state: window, dedup ids and the last recorded buy rate.
#[derive(Debug)]
struct PriceLedger {
    window: HistoryWindow<PriceTick>,
    dedup: DedupSet,
    last_buy: Option<i64>,
}

/// Rolling history for both feeds.
#[derive(Debug)]
pub struct HistoryStore {
    prices: RwLock<PriceLedger>,
    rates: RwLock<HistoryWindow<RateTick>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Parse an upstream rate. Accepts integer or decimal text and truncates
/// toward zero. Zero, negative and non-finite rates count as missing, which
/// also keeps `buy - prev` within range.
fn parse_rate(raw: Option<&str>) -> Option<i64> {
    let value: f64 = raw?.trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let rate = value.trunc() as i64;
    (rate > 0).then_some(rate)
}

impl HistoryStore {
    pub fn new(price_capacity: usize, rate_capacity: usize, dedup_capacity: usize) -> Self {
        Self {
            prices: RwLock::new(PriceLedger {
                window: HistoryWindow::new(price_capacity),
                dedup: DedupSet::new(dedup_capacity),
                last_buy: None,
            }),
            rates: RwLock::new(HistoryWindow::new(rate_capacity)),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.price_history_capacity,
            config.rate_history_capacity,
            config.dedup_capacity,
        )
    }

    /// Offer a price quote.
    ///
    /// Rejected when a field is missing or a rate is non-numeric; dropped as a
    /// duplicate when its revision id was already recorded. Otherwise status
    /// and diff are computed against the last recorded buy rate and the tick
    /// is appended.
    pub fn record_price(&self, quote: &RawPriceQuote) -> RecordOutcome {
        let update_id = match quote.updated_at.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return RecordOutcome::Rejected,
        };
        let (Some(buy), Some(sell)) = (
            parse_rate(quote.buying_rate.as_deref()),
            parse_rate(quote.selling_rate.as_deref()),
        ) else {
            return RecordOutcome::Rejected;
        };

        let mut ledger = write(&self.prices);
        if ledger.dedup.contains(update_id) {
            debug!(update_id, "Dropping duplicate price update");
            return RecordOutcome::Duplicate;
        }

        let status = TickStatus::from_change(ledger.last_buy, buy);
        let diff = ledger.last_buy.map_or(0, |prev| buy - prev);

        ledger.window.push(PriceTick {
            buy_rate: buy,
            sell_rate: sell,
            status,
            diff,
            source_update_id: update_id.to_string(),
            timestamp: update_id.to_string(),
        });
        ledger.last_buy = Some(buy);
        ledger.dedup.insert(update_id);

        debug!(buy, sell, diff, ?status, "Price tick recorded");
        RecordOutcome::Appended
    }

    /// Offer a rate quote. Appended only if it differs from the most recent
    /// recorded price text.
    pub fn record_rate(&self, price: &str, time: String) -> RecordOutcome {
        let price = price.trim();
        if price.is_empty() {
            return RecordOutcome::Rejected;
        }

        let mut rates = write(&self.rates);
        if rates.last().is_some_and(|last| last.price == price) {
            return RecordOutcome::Unchanged;
        }
        rates.push(RateTick {
            price: price.to_string(),
            time,
        });

        debug!(price, "Rate tick recorded");
        RecordOutcome::Appended
    }

    /// Copy of the price window, oldest first.
    pub fn price_view(&self) -> Vec<PriceTick> {
        read(&self.prices).window.to_vec()
    }

    /// Copy of the rate window, oldest first.
    pub fn rate_view(&self) -> Vec<RateTick> {
        read(&self.rates).to_vec()
    }

    pub fn price_len(&self) -> usize {
        read(&self.prices).window.len()
    }

    pub fn rate_len(&self) -> usize {
        read(&self.rates).len()
    }

    /// Number of revision ids currently remembered for dedup.
    pub fn dedup_len(&self) -> usize {
        read(&self.prices).dedup.len()
    }
}
