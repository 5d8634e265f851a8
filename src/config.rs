//! Service configuration
//!
//! Every tunable of the aggregation and broadcast engine lives here with the
//! production default. `ServiceConfig::from_env` overrides a subset from the
//! process environment; malformed values keep the default.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Upstream gold-rate API.
pub const DEFAULT_PRICE_SOURCE_URL: &str = "https://api.treasury.id/api/v1/antigrvty/gold/rate";

/// USD-IDR quote page.
pub const DEFAULT_RATE_SOURCE_URL: &str = "https://www.google.com/finance/quote/USD-IDR";

/// Capped linear backoff parameters for one poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay added per consecutive failure.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

/// Configuration for the whole service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,

    // History
    /// Price ticks kept (one per minute for a day, plus one).
    pub price_history_capacity: usize,
    /// Rate ticks kept.
    pub rate_history_capacity: usize,
    /// Recently seen upstream revision ids remembered for dedup.
    pub dedup_capacity: usize,

    // Snapshot / broadcast
    /// Cached snapshot bytes are served without rebuild while younger than this.
    pub snapshot_ttl: Duration,
    /// Coalescing window for change notifications.
    pub debounce: Duration,
    pub max_connections: usize,
    pub broadcast_chunk_size: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Idle time on a subscriber socket before the server pings it.
    pub idle_timeout: Duration,

    // Pollers
    pub price_poll_interval: Duration,
    pub rate_poll_interval: Duration,
    pub price_backoff: BackoffConfig,
    pub rate_backoff: BackoffConfig,

    // Collaborators
    pub price_source_url: String,
    pub rate_source_url: String,
    /// Offset from UTC of the wall clock stamped on rate ticks.
    pub rate_utc_offset_hours: i32,

    /// Bearer token for the annotation endpoint. `None` disables the endpoint.
    pub admin_token: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            price_history_capacity: 1441,
            rate_history_capacity: 11,
            dedup_capacity: 5000,
            snapshot_ttl: Duration::from_millis(50),
            debounce: Duration::from_millis(8),
            max_connections: 500,
            broadcast_chunk_size: 50,
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            price_poll_interval: Duration::from_millis(20),
            rate_poll_interval: Duration::from_millis(300),
            price_backoff: BackoffConfig {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(2),
            },
            rate_backoff: BackoffConfig {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(10),
            },
            price_source_url: DEFAULT_PRICE_SOURCE_URL.to_string(),
            rate_source_url: DEFAULT_RATE_SOURCE_URL.to_string(),
            rate_utc_offset_hours: 7,
            admin_token: None,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_str(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "ignoring malformed environment value");
            default
        }),
        None => default,
    }
}

impl ServiceConfig {
    /// Build the configuration from defaults overridden by the environment.
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            bind: env_str("BIND").unwrap_or(d.bind),
            port: env_parse("PORT", d.port),
            price_poll_interval: Duration::from_millis(env_parse(
                "PRICE_POLL_MS",
                d.price_poll_interval.as_millis() as u64,
            )),
            rate_poll_interval: Duration::from_millis(env_parse(
                "RATE_POLL_MS",
                d.rate_poll_interval.as_millis() as u64,
            )),
            max_connections: env_parse("MAX_CONNECTIONS", d.max_connections),
            price_source_url: env_str("PRICE_SOURCE_URL").unwrap_or(d.price_source_url),
            rate_source_url: env_str("RATE_SOURCE_URL").unwrap_or(d.rate_source_url),
            rate_utc_offset_hours: env_parse("RATE_UTC_OFFSET_HOURS", d.rate_utc_offset_hours),
            admin_token: env_str("ADMIN_TOKEN"),
            ..d
        }
    }

    /// Socket address string for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
