//! Process-scoped application context
//!
//! Built once at startup and shared by handle with every task and handler.

use std::sync::Arc;

use crate::annotation::Annotation;
use crate::config::ServiceConfig;
use crate::coordinator::BroadcastCoordinator;
use crate::history::HistoryStore;
use crate::metrics::ServiceMetrics;
use crate::registry::{RegistryConfig, SubscriberRegistry};
use crate::snapshot::SnapshotCache;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServiceConfig>,
    pub history: Arc<HistoryStore>,
    pub annotation: Arc<Annotation>,
    pub metrics: Arc<ServiceMetrics>,
    pub cache: Arc<SnapshotCache>,
    pub registry: Arc<SubscriberRegistry>,
    pub coordinator: Arc<BroadcastCoordinator>,
}

impl AppContext {
    pub fn new(config: ServiceConfig) -> Self {
        let metrics = Arc::new(ServiceMetrics::new());
        let history = Arc::new(HistoryStore::from_config(&config));
        let annotation = Arc::new(Annotation::new());
        let cache = Arc::new(SnapshotCache::new(
            history.clone(),
            annotation.clone(),
            metrics.clone(),
            config.snapshot_ttl,
        ));
        let registry = Arc::new(SubscriberRegistry::new(
            RegistryConfig::from(&config),
            metrics.clone(),
        ));
        let coordinator = Arc::new(BroadcastCoordinator::new(
            cache.clone(),
            registry.clone(),
            config.debounce,
        ));

        Self {
            config: Arc::new(config),
            history,
            annotation,
            metrics,
            cache,
            registry,
            coordinator,
        }
    }

    /// Replace the operator annotation and schedule a broadcast. Blank text
    /// is refused and nothing is scheduled.
    pub fn set_annotation(&self, text: &str) -> bool {
        if !self.annotation.replace(text) {
            return false;
        }
        self.coordinator.notify();
        true
    }
}
