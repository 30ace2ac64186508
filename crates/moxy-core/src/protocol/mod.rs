//! MQTT wire-level types observed by the proxy.
//!
//! The proxy never builds or rewrites packets. This module only gives names
//! to bytes that already crossed the wire:
//! - [`Pdu`] - one complete, immutable control packet
//! - [`MessageType`] - the high nibble of the fixed header
//! - [`decode`] - read-only extraction of the message type and CONNECT fields

pub mod decoder;
pub mod message_type;
pub mod pdu;

pub use decoder::{decode, ConnectFields, ConnectFlags, DecodedPdu};
pub use message_type::{decode_msgtype, MessageType};
pub use pdu::{decode_remaining_length, encode_remaining_length, Pdu};
