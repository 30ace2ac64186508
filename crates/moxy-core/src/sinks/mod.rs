//! Read-only consumers of relayed PDUs.
//!
//! A relay pipeline hands every framed PDU to each of its sinks before
//! forwarding it. Sinks observe; they cannot alter or hold back the bytes on
//! the wire, and their failures are logged rather than propagated.
//!
//! - [`ConsoleSink`] - direction label, message type, hex dump, CONNECT fields
//! - [`TraceRecorder`] - append-only per-session trace file of JSON records

pub mod console;
pub mod recorder;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::network::Direction;
use crate::protocol::{DecodedPdu, Pdu};

pub use console::{hex_dump, ConsoleSink};
pub use recorder::{trace_file_name, TraceRecord, TraceRecorder, TRACE_FILE_SUFFIX};

/// What a sink is shown for one PDU.
#[derive(Debug, Clone, Copy)]
pub struct PduObservation<'a> {
    /// Which leg of the session the PDU travels on.
    pub direction: Direction,
    /// The raw PDU, exactly as it will be forwarded.
    pub pdu: &'a Pdu,
    /// Message type and, for CONNECT, the structured fields.
    pub decoded: &'a DecodedPdu,
}

/// A consumer of relayed PDUs.
#[async_trait]
pub trait PduSink: Send {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Accept one PDU.
    async fn accept(&mut self, observation: &PduObservation<'_>) -> Result<(), SinkError>;

    /// Flush buffered output; called once when the owning pipeline ends.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
