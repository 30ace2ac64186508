//! Prometheus metrics for the MQTT intercepting proxy.
//!
//! Provides counters and gauges for session lifecycle, relayed traffic and
//! sink failures.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Proxy metrics collection.
///
/// Contains all metrics exposed by the proxy for monitoring.
pub struct ProxyMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Total client sessions accepted.
    pub sessions_total: IntCounter,

    /// Sessions currently relaying or tearing down.
    pub active_sessions: IntGauge,

    /// Failed dials to the upstream broker.
    pub upstream_connect_failures: IntCounter,

    /// Relayed PDUs by direction and message type.
    pub pdus_total: IntCounterVec,

    /// Relayed bytes by direction.
    pub bytes_total: IntCounterVec,

    /// Session-terminating errors by kind.
    pub session_errors: IntCounterVec,

    /// Sink failures by sink name.
    pub sink_errors: IntCounterVec,
}

impl ProxyMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "moxy_sessions_total",
            "Total number of client sessions accepted",
        )
        .expect("metric creation should succeed");

        let active_sessions = IntGauge::new(
            "moxy_active_sessions",
            "Current number of active client sessions",
        )
        .expect("metric creation should succeed");

        let upstream_connect_failures = IntCounter::new(
            "moxy_upstream_connect_failures_total",
            "Total number of failed connections to the upstream broker",
        )
        .expect("metric creation should succeed");

        let pdus_total = IntCounterVec::new(
            Opts::new(
                "moxy_pdus_total",
                "Total number of PDUs relayed by direction and message type",
            ),
            &["direction", "message_type"],
        )
        .expect("metric creation should succeed");

        let bytes_total = IntCounterVec::new(
            Opts::new("moxy_bytes_total", "Total bytes relayed by direction"),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let session_errors = IntCounterVec::new(
            Opts::new(
                "moxy_session_errors_total",
                "Total number of session-terminating errors by kind",
            ),
            &["kind"],
        )
        .expect("metric creation should succeed");

        let sink_errors = IntCounterVec::new(
            Opts::new("moxy_sink_errors_total", "Total number of sink failures by sink"),
            &["sink"],
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(sessions_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(upstream_connect_failures.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(pdus_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(bytes_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(session_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(sink_errors.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            sessions_total,
            active_sessions,
            upstream_connect_failures,
            pdus_total,
            bytes_total,
            session_errors,
            sink_errors,
        }
    }

    /// Record a newly accepted session.
    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    /// Record a session leaving the active set.
    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    /// Record a failed upstream dial.
    pub fn record_upstream_failure(&self) {
        self.upstream_connect_failures.inc();
    }

    /// Record one relayed PDU.
    pub fn record_pdu(&self, direction: &str, message_type: &str, bytes: usize) {
        self.pdus_total
            .with_label_values(&[direction, message_type])
            .inc();
        self.bytes_total
            .with_label_values(&[direction])
            .inc_by(bytes as u64);
    }

    /// Record a session-terminating error.
    pub fn record_session_error(&self, kind: &str) {
        self.session_errors.with_label_values(&[kind]).inc();
    }

    /// Record a sink failure.
    pub fn record_sink_error(&self, sink: &str) {
        self.sink_errors.with_label_values(&[sink]).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
