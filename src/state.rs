//! # Application State Management
//!
//! Shared state handed to every HTTP handler and media-stream actor.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and actors hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//!
//! `parking_lot` locks are used throughout; they do not poison, so reading
//! the config or metrics never has to handle a poisoned-lock error.
//!
//! ## What lives here:
//! - runtime-updatable configuration
//! - request and relay metrics
//! - the call registry, call store, and model connector shared by all calls

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::model::{GeminiConnector, ModelConnector};
use crate::relay::{CallRegistry, SessionStats};
use crate::store::{CallStore, InMemoryCallStore};

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and relay metrics, updated by middleware and call teardown
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live relay sessions
    pub registry: Arc<CallRegistry>,

    /// Business directory and call records
    pub store: Arc<dyn CallStore>,

    /// Opens model connections for new calls
    pub connector: Arc<dyn ModelConnector>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all requests and calls.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /route/pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Totals folded in from finished relay sessions
    pub relay: RelayTotals,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Relay counters summed over every call since server start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayTotals {
    pub calls_started: u64,
    pub calls_rejected: u64,
    pub calls_finished: u64,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub bytes_to_model: u64,
    pub turns_dispatched: u64,
    pub audio_chunks_out: u64,
    pub audio_chunks_dropped: u64,
    pub events_discarded: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CallStore>,
        connector: Arc<dyn ModelConnector>,
    ) -> Self {
        let registry = Arc::new(CallRegistry::new(config.performance.max_concurrent_calls));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            store,
            connector,
            start_time: Instant::now(),
        }
    }

    /// State wired to the in-memory store (seeded with the configured
    /// businesses) and the Gemini Live connector.
    pub fn from_config(config: AppConfig) -> Self {
        let store = Arc::new(InMemoryCallStore::new(config.businesses.clone()));
        let connector = Arc::new(GeminiConnector::from_config(&config.model));
        Self::new(config, store, connector)
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The call limit takes effect for the next call; live calls are kept.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.registry
            .set_max_concurrent_calls(new_config.performance.max_concurrent_calls);
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_call_started(&self) {
        self.metrics.write().relay.calls_started += 1;
    }

    pub fn record_call_rejected(&self) {
        self.metrics.write().relay.calls_rejected += 1;
    }

    /// Frames that arrived before a relay was streaming.
    pub fn record_frames_dropped(&self, frames: u64) {
        self.metrics.write().relay.frames_dropped += frames;
    }

    /// Fold a finished session's counters into the totals.
    pub fn record_call_finished(&self, stats: &SessionStats) {
        let mut metrics = self.metrics.write();
        let relay = &mut metrics.relay;

        relay.calls_finished += 1;
        relay.frames_in += stats.frames_in;
        relay.frames_dropped += stats.frames_dropped;
        relay.bytes_to_model += stats.bytes_to_model;
        relay.turns_dispatched += stats.turns_dispatched;
        relay.audio_chunks_out += stats.audio_chunks_out;
        relay.audio_chunks_dropped += stats.audio_chunks_dropped;
        relay.events_discarded += stats.events_discarded;
    }

    /// Copy of the current metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
