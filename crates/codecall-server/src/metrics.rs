//! Prometheus metrics for the codecall runtime.
//!
//! This module is only compiled when the `metrics` feature is enabled.
//! Session and call outcomes are fed from audit entries through
//! [`MetricsAuditLogger`]; gauges are bridged from the coordinator's counts
//! by [`CodecallMetrics::observe`].

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use codecall_sandbox::audit::{AuditEntry, AuditLogger};
use codecall_sandbox::channel::CallState;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::session::SessionCoordinator;

/// Label set for session metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    /// "success", "error", "timeout" or "cancelled".
    pub outcome: String,
}

/// Label set for call metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    /// "resolved", "errored" or "abandoned".
    pub outcome: String,
}

/// Prometheus metrics for the runtime.
pub struct CodecallMetrics {
    /// Finished sessions by outcome.
    pub sessions_total: Family<SessionLabels, Counter>,
    /// Session duration in seconds.
    pub session_duration_seconds: Histogram,
    /// Finished calls by outcome.
    pub calls_total: Family<CallLabels, Counter>,
    /// Sessions holding a slot.
    pub sessions_running: Gauge<i64, AtomicI64>,
    /// Sessions waiting for a slot.
    pub sessions_queued: Gauge<i64, AtomicI64>,
    /// Late or unknown call results discarded so far (bridged from the call table).
    pub late_results_discarded: Gauge<i64, AtomicI64>,
}

impl CodecallMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sessions_total = Family::default();
        registry.register(
            "codecall_sessions_total",
            "Finished sessions by outcome",
            sessions_total.clone(),
        );

        let session_duration_seconds =
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter());
        registry.register(
            "codecall_session_duration_seconds",
            "Session duration",
            session_duration_seconds.clone(),
        );

        let calls_total = Family::default();
        registry.register(
            "codecall_calls_total",
            "Finished calls by outcome",
            calls_total.clone(),
        );

        let sessions_running = Gauge::default();
        registry.register(
            "codecall_sessions_running",
            "Sessions currently running",
            sessions_running.clone(),
        );

        let sessions_queued = Gauge::default();
        registry.register(
            "codecall_sessions_queued",
            "Sessions waiting for a slot",
            sessions_queued.clone(),
        );

        let late_results_discarded = Gauge::default();
        registry.register(
            "codecall_late_results_discarded",
            "Call results discarded because the call was already terminal",
            late_results_discarded.clone(),
        );

        Self {
            sessions_total,
            session_duration_seconds,
            calls_total,
            sessions_running,
            sessions_queued,
            late_results_discarded,
        }
    }

    /// Record a finished session and its calls.
    pub fn record_session(&self, entry: &AuditEntry) {
        let labels = SessionLabels {
            outcome: entry.outcome.label().to_string(),
        };
        self.sessions_total.get_or_create(&labels).inc();
        self.session_duration_seconds
            .observe(entry.duration_ms as f64 / 1000.0);
        for call in &entry.calls {
            let labels = CallLabels {
                outcome: call_outcome(call.state).to_string(),
            };
            self.calls_total.get_or_create(&labels).inc();
        }
    }

    /// Refresh the gauges from the coordinator.
    pub fn observe(&self, coordinator: &SessionCoordinator) {
        let counts = coordinator.counts();
        self.sessions_running.set(counts.running as i64);
        self.sessions_queued.set(counts.queued as i64);
        self.late_results_discarded
            .set(coordinator.engine().calls().discarded() as i64);
    }
}

fn call_outcome(state: CallState) -> &'static str {
    match state {
        CallState::Pending => "pending",
        CallState::Resolved => "resolved",
        CallState::Errored => "errored",
        CallState::Abandoned => "abandoned",
    }
}

/// An audit logger that records metrics, then forwards to another logger.
pub struct MetricsAuditLogger {
    metrics: Arc<CodecallMetrics>,
    inner: Arc<dyn AuditLogger>,
}

impl MetricsAuditLogger {
    /// Record into `metrics` and forward every entry to `inner`.
    pub fn new(metrics: Arc<CodecallMetrics>, inner: Arc<dyn AuditLogger>) -> Self {
        Self { metrics, inner }
    }
}

#[async_trait::async_trait]
impl AuditLogger for MetricsAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.metrics.record_session(entry);
        self.inner.log(entry).await;
    }
}
