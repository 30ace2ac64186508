//! Test utilities for the MQTT intercepting proxy.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBroker`] - A lightweight mock MQTT broker for testing
//! - [`ProxyTestHarness`] - A running proxy in front of a mock broker
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//! - [`packets`] - Builders for common control packets
//!
//! # Example
//!
//! ```rust,ignore
//! use moxy_core::testing::{packets, ProxyTestHarness};
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::test]
//! async fn test_connect_is_forwarded() {
//!     let harness = ProxyTestHarness::new().await;
//!
//!     let mut client = harness.connect_client().await.unwrap();
//!     client.write_all(&packets::connect("dev1")).await.unwrap();
//!
//!     let calls = harness.wait_for_broker_calls(1).await;
//!     assert_eq!(calls.len(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_broker;
pub mod packets;

pub use harness::{ProxyTestHarness, TestHarnessBuilder};
pub use mock_broker::{BrokerCall, MockBroker, Reply, ResponseGenerator};
