//! Metrics collection for observability
//!
//! Prometheus collectors for the batch settlement service. Each service
//! instance owns its registry.
//!
//! # Metrics
//!
//! - `batch_settlement_batches_total` - Batches started
//! - `batch_settlement_requests_submitted_total` - Requests accepted at submit
//! - `batch_settlement_requests_completed_total` - Requests settled
//! - `batch_settlement_requests_failed_total` - Requests failed
//! - `batch_settlement_requests_requeued_total` - Requests returned to pending
//! - `batch_settlement_fallback_total` - Batches that used fallback settlement
//! - `batch_settlement_pending_requests` - Live pending count
//! - `batch_settlement_batch_duration_seconds` - Batch duration histogram

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Batches started
    pub batches_total: IntCounter,

    /// Requests accepted
    pub submitted_total: IntCounter,

    /// Requests completed
    pub completed_total: IntCounter,

    /// Requests failed
    pub failed_total: IntCounter,

    /// Requests requeued
    pub requeued_total: IntCounter,

    /// Fallback invocations
    pub fallback_total: IntCounter,

    /// Pending requests
    pub pending: IntGauge,

    /// Batch duration histogram
    pub batch_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let batches_total = IntCounter::new("batch_settlement_batches_total", "Batches started")?;
        registry.register(Box::new(batches_total.clone()))?;

        let submitted_total = IntCounter::new(
            "batch_settlement_requests_submitted_total",
            "Requests accepted at submit",
        )?;
        registry.register(Box::new(submitted_total.clone()))?;

        let completed_total = IntCounter::new(
            "batch_settlement_requests_completed_total",
            "Requests settled",
        )?;
        registry.register(Box::new(completed_total.clone()))?;

        let failed_total =
            IntCounter::new("batch_settlement_requests_failed_total", "Requests failed")?;
        registry.register(Box::new(failed_total.clone()))?;

        let requeued_total = IntCounter::new(
            "batch_settlement_requests_requeued_total",
            "Requests returned to pending",
        )?;
        registry.register(Box::new(requeued_total.clone()))?;

        let fallback_total = IntCounter::new(
            "batch_settlement_fallback_total",
            "Batches that used fallback settlement",
        )?;
        registry.register(Box::new(fallback_total.clone()))?;

        let pending = IntGauge::new("batch_settlement_pending_requests", "Live pending count")?;
        registry.register(Box::new(pending.clone()))?;

        let batch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_settlement_batch_duration_seconds",
                "Batch duration from claim to close",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self {
            batches_total,
            submitted_total,
            completed_total,
            failed_total,
            requeued_total,
            fallback_total,
            pending,
            batch_duration,
            registry,
        })
    }

    /// Update pending gauge
    pub fn set_pending(&self, count: usize) {
        self.pending.set(count as i64);
    }

    /// Text exposition of all collectors
    pub fn gather_text(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Other(e.to_string()))
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("batches_total", &self.batches_total.get())
            .field("pending", &self.pending.get())
            .finish_non_exhaustive()
    }
}
