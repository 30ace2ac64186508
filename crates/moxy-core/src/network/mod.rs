//! Network layer for the MQTT intercepting proxy.
//!
//! This module provides:
//! - TCP listener for accepting client connections
//! - MQTT frame codec and reader for splitting streams into PDUs
//! - Relay pipelines, one per session direction
//! - Session coordinator tying a client connection to its upstream

pub mod codec;
pub mod listener;
pub mod relay;
pub mod session;

pub use codec::{FrameReader, MqttCodec};
pub use listener::ProxyListener;
pub use relay::{Direction, RelayEnd, RelayPipeline, RelayStats};
pub use session::{SessionCoordinator, SessionReport, SessionState, TeardownCause};
