//! MQTT PDU framing codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for MQTT control packets.
//! MQTT framing is a one-byte fixed header followed by a variable-length
//! remaining-length field (1-4 bytes) and exactly that many bytes.
//!
//! The decoder never hands out a partial PDU: bytes stay in the read buffer
//! until the whole packet has arrived. The encoder writes PDUs verbatim.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::config::MAX_MQTT_PDU_SIZE;
use crate::error::FrameError;
use crate::protocol::{decode_remaining_length, Pdu};

/// Upper bound on speculative buffer growth for a declared-but-unread payload.
const MAX_RESERVE: usize = 64 * 1024;

/// Codec for MQTT wire protocol PDUs.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_pdu_size: usize,
}

impl MqttCodec {
    /// Create a new codec accepting any legal MQTT PDU.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_pdu_size: MAX_MQTT_PDU_SIZE,
        }
    }

    /// Create a new codec with a custom PDU ceiling (header bytes included).
    #[must_use]
    pub fn with_max_pdu_size(max_pdu_size: usize) -> Self {
        Self { max_pdu_size }
    }

    /// The configured PDU ceiling.
    #[must_use]
    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MqttCodec {
    type Item = Pdu;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the fixed header and at least one length byte
        if src.len() < 2 {
            return Ok(None);
        }

        let Some((remaining, width)) = decode_remaining_length(&src[1..])? else {
            return Ok(None);
        };

        let header_len = 1 + width;
        let total = header_len + remaining;

        if total > self.max_pdu_size {
            return Err(FrameError::TooLarge {
                size: total,
                max: self.max_pdu_size,
            });
        }

        if src.len() < total {
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        let bytes = src.split_to(total).freeze();
        Ok(Some(Pdu::from_framed(bytes, header_len)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(pdu) => Ok(Some(pdu)),
            // Closed between PDUs: ordinary end of stream.
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Pdu> for MqttCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Pulls complete PDUs off an ordered byte stream.
///
/// One reader per connection direction; its partial-PDU buffer is owned by
/// the task driving it and never exposed.
pub struct FrameReader<R> {
    inner: FramedRead<R, MqttCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader accepting any legal MQTT PDU.
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, MqttCodec::new())
    }

    /// Create a reader with a specific codec configuration.
    pub fn with_codec(reader: R, codec: MqttCodec) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }

    /// Read the next complete PDU.
    ///
    /// Returns `Ok(None)` when the stream closes cleanly between PDUs.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if the stream closes mid-PDU,
    /// [`FrameError::RemainingLengthTooLong`] or [`FrameError::TooLarge`] for
    /// malformed framing, and [`FrameError::Io`] for read failures.
    pub async fn next_pdu(&mut self) -> Result<Option<Pdu>, FrameError> {
        self.inner.next().await.transpose()
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}
