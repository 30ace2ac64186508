//! Moxy Core Library
//!
//! This library provides the core functionality for a transparent,
//! intercepting MQTT proxy. Every client connection is paired with a fresh
//! connection to one upstream broker; complete control packets are relayed
//! byte-for-byte in both directions while being shown to a console dump and,
//! optionally, recorded to a per-session trace file.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`protocol`] - PDU type, remaining-length codec, CONNECT decoding
//! - [`network`] - Listener, frame codec, relay pipelines, session coordinator
//! - [`sinks`] - Console dumper and trace file recorder
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use moxy_core::config::ProxyConfig;
//! use moxy_core::network::ProxyListener;
//!
//! let config = ProxyConfig::from_file("moxy.yaml")?;
//! let listener = ProxyListener::bind(config).await?;
//! listener.run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod sinks;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use error::{ConfigError, DecodeError, FrameError, ProxyError, Result, SinkError};
pub use network::{ProxyListener, RelayPipeline, SessionCoordinator};
pub use protocol::{MessageType, Pdu};
