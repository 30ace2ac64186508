//! Metrics collection for the MQTT intercepting proxy.
//!
//! Provides Prometheus-compatible metrics for session counts, relayed
//! traffic and error rates.

pub mod prometheus;

pub use prometheus::ProxyMetrics;
