//! Display formatting for dashboard snapshots
//!
//! Pure functions over tick values, plus `DisplayFormatter`, which fronts the
//! hot ones with size-capped memo tables. The formatter is owned by the
//! snapshot cache and only touched under its rebuild lock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use chrono::{Datelike, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::history::TickStatus;

/// Weekday names, Monday first.
const WEEKDAYS: [&str; 7] = ["Senin", "Selasa", "Rabu", "Kamis", "Jumat", "Sabtu", "Minggu"];

const SOURCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// (capital, principal) pairs for the jt20 / jt30 / jt40 / jt50 columns.
pub const PROFIT_TIERS: [(i64, i64); 4] = [
    (20_000_000, 19_314_000),
    (30_000_000, 28_980_000),
    (40_000_000, 38_652_000),
    (50_000_000, 48_325_000),
];

/// Group the digits of `digits` in threes separated by `.`.
fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    out
}

/// Format an amount with `.` thousands separators: 1050000 → "1.050.000".
pub fn format_rupiah(n: i64) -> String {
    let grouped = group_thousands(&n.unsigned_abs().to_string());
    if n < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Absolute value of `n` with thousands separators. Total over all of `i64`.
fn format_magnitude(n: i64) -> String {
    group_thousands(&n.unsigned_abs().to_string())
}

/// "2024-01-01 10:00:00" → "Senin 10:00:00". Unparsable input is returned as is.
pub fn day_time(timestamp: &str) -> String {
    match NaiveDateTime::parse_from_str(timestamp, SOURCE_TIMESTAMP_FORMAT) {
        Ok(dt) => format!(
            "{} {}",
            WEEKDAYS[dt.weekday().num_days_from_monday() as usize],
            dt.format("%H:%M:%S")
        ),
        Err(_) => timestamp.to_string(),
    }
}

/// Signed change with its status marker.
pub fn diff_display(diff: i64, status: TickStatus) -> String {
    match status {
        TickStatus::Up => format!("{}+{}", status.marker(), format_rupiah(diff)),
        TickStatus::Down => format!("{}-{}", status.marker(), format_magnitude(diff)),
        TickStatus::Flat => format!("{}tetap", status.marker()),
    }
}

pub fn transaction_display(buy: &str, sell: &str, diff_display: &str) -> String {
    format!("Beli: {}<br>Jual: {}<br>{}", buy, sell, diff_display)
}

/// Grams rounded to 4 decimals with `.` grouping on the integer part.
fn format_grams(grams: Decimal) -> String {
    let text = format!("{:.4}", grams.round_dp(4));
    match text.split_once('.') {
        Some((int_part, frac)) => format!("{}.{}", group_thousands(int_part), frac),
        None => group_thousands(&text),
    }
}

/// Profit of buying `capital` worth at `buy` and selling at `sell`, net of
/// `principal`. Returns "-" when the buy rate cannot be divided by.
pub fn profit_display(buy: i64, sell: i64, capital: i64, principal: i64) -> String {
    if buy <= 0 {
        return "-".to_string();
    }
    let grams = Decimal::from(capital) / Decimal::from(buy);
    let Some(value) = (grams * Decimal::from(sell) - Decimal::from(principal))
        .trunc()
        .to_i64()
    else {
        return "-".to_string();
    };
    let grams = format_grams(grams);

    if value > 0 {
        format!("+{}🟢➺{}gr", format_rupiah(value), grams)
    } else if value < 0 {
        format!("-{}🔴➺{}gr", format_magnitude(value), grams)
    } else {
        format!("{}➖➺{}gr", format_rupiah(0), grams)
    }
}

/// Size-capped memo table. When full, the oldest inserted key is evicted.
#[derive(Debug)]
pub struct BoundedMemo<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedMemo<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Return the memoized value for `key`, computing it on a miss.
    pub fn get_or_insert_with(&mut self, key: K, compute: impl FnOnce(&K) -> V) -> V {
        if let Some(value) = self.entries.get(&key) {
            return value.clone();
        }
        let value = compute(&key);
        if self.capacity == 0 {
            return value;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Memoizing front for the hot formatting functions.
#[derive(Debug)]
pub struct DisplayFormatter {
    rupiah: BoundedMemo<i64, String>,
    day_time: BoundedMemo<String, String>,
    diff: BoundedMemo<(i64, TickStatus), String>,
}

impl DisplayFormatter {
    pub fn new() -> Self {
        Self {
            rupiah: BoundedMemo::new(1024),
            day_time: BoundedMemo::new(512),
            diff: BoundedMemo::new(256),
        }
    }

    pub fn rupiah(&mut self, n: i64) -> String {
        self.rupiah.get_or_insert_with(n, |n| format_rupiah(*n))
    }

    pub fn day_time(&mut self, timestamp: &str) -> String {
        self.day_time
            .get_or_insert_with(timestamp.to_string(), |ts| day_time(ts))
    }

    pub fn diff(&mut self, diff: i64, status: TickStatus) -> String {
        self.diff
            .get_or_insert_with((diff, status), |(d, s)| diff_display(*d, *s))
    }
}

impl Default for DisplayFormatter {
    fn default() -> Self {
        Self::new()
    }
}
