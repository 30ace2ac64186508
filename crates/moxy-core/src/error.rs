//! Domain error types for the MQTT intercepting proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// PDU ceiling too small to hold even a fixed header and length byte.
    #[error("max_pdu_size must be at least 2, got {0}")]
    MaxPduSizeTooSmall(usize),
}

/// Errors raised while splitting a byte stream into MQTT PDUs.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The remaining-length field continued past its fourth byte.
    #[error("malformed remaining length: continuation bit set on byte {0}")]
    RemainingLengthTooLong(usize),

    /// The declared PDU exceeds the configured ceiling.
    #[error("PDU size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// The stream ended after a PDU had been started.
    #[error("stream closed mid-PDU with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    /// A buffer handed to `Pdu::try_from_bytes` does not hold exactly one PDU.
    #[error("expected a single PDU of {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Read failure on the underlying stream.
    #[error("stream read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding the structured fields of a PDU.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A field claims more bytes than remain in the PDU.
    #[error("field '{field}' needs {needed} bytes but only {available} remain")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A variable byte integer inside the PDU is longer than four bytes.
    #[error("field '{field}' has a malformed variable byte integer")]
    MalformedVarInt { field: &'static str },
}

/// Errors raised by a PDU sink. Never fatal to the relay.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing to the sink's output failed.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a trace record failed.
    #[error("trace record encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that terminate a session.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO connection error on an established socket.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Dialing the upstream broker failed.
    #[error("failed to connect to upstream {address}: {source}")]
    UpstreamConnect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The byte stream could not be framed into PDUs.
    #[error("framing error: {0}")]
    Framing(FrameError),

    /// A framed PDU could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A relay task panicked or was aborted before reporting.
    #[error("relay task aborted: {0}")]
    PipelineAborted(String),

    /// Shutdown signal received.
    #[error("proxy shutting down")]
    Shutdown,
}

impl ProxyError {
    /// Short label used for metrics and session summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::UpstreamConnect { .. } => "upstream_connect",
            Self::Framing(_) => "framing",
            Self::Decode(_) => "decode",
            Self::PipelineAborted(_) => "aborted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<FrameError> for ProxyError {
    // Socket failures surfaced through the codec stay connection errors.
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io_err) => Self::Connection(io_err),
            other => Self::Framing(other),
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
