//! Gold Price Monitor
//!
//! Polls an upstream gold-rate API and a USD-IDR quote page and produces:
//! - Bounded, deduplicated price and rate histories
//! - A cached, whole-state JSON snapshot with dashboard formatting
//! - Coalesced WebSocket fan-out of that snapshot to up to 500 subscribers
//! - Heartbeats, a polling endpoint and an operator annotation channel
//!
//! # Architecture
//!
//! ```text
//!  PriceSource        RateSource       Annotation (POST /api/annotation)
//!       │                  │                  │
//!  ┌────▼─────┐      ┌─────▼────┐             │
//!  │PriceFeed │      │ RateFeed │             │
//!  └────┬─────┘      └─────┬────┘             │
//!       │                  │                  │
//!  ┌────▼──────────────────▼───┐              │
//!  │       HistoryStore        │              │
//!  └────┬──────────────────────┘              │
//!       │ notify()                            │
//!  ┌────▼─────────────────────────────────────▼──┐
//!  │ BroadcastCoordinator (8 ms debounce)        │
//!  └────┬────────────────────────────────────────┘
//!       │ invalidate + get_snapshot_bytes
//!  ┌────▼──────────┐        ┌──────────────────┐
//!  │ SnapshotCache │◄───────│ GET /api/state   │
//!  └────┬──────────┘        └──────────────────┘
//!       │ broadcast(bytes)
//!  ┌────▼──────────────────┐   ┌───────────┐
//!  │  SubscriberRegistry   │◄──│ Heartbeat │
//!  └───────────────────────┘   └───────────┘
//! ```

pub mod annotation;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod heartbeat;
pub mod history;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod sources;

pub use config::ServiceConfig;
pub use context::AppContext;

pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
