//! Complete MQTT control packets as seen on the wire.
//!
//! A PDU is a fixed header byte, a 1-4 byte remaining-length field
//! (base-128, least significant group first, top bit as continuation),
//! then exactly `remaining length` bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

use super::message_type::MessageType;

/// Maximum width of the remaining-length field.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Largest value the remaining-length field can encode.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a remaining-length field.
///
/// `buf` starts at the first length byte (the byte after the fixed header).
/// Returns `(value, field_width)`, or `None` if `buf` ends before the
/// terminating byte.
///
/// # Errors
///
/// Returns [`FrameError::RemainingLengthTooLong`] if the fourth byte still
/// carries the continuation bit.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().take(MAX_REMAINING_LENGTH_BYTES).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        if i + 1 == MAX_REMAINING_LENGTH_BYTES {
            return Err(FrameError::RemainingLengthTooLong(i + 1));
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Append the remaining-length encoding of `len` to `dst`.
///
/// Values above [`MAX_REMAINING_LENGTH`] are not representable; callers
/// building test traffic stay within range.
pub fn encode_remaining_length(mut len: usize, dst: &mut BytesMut) {
    debug_assert!(len <= MAX_REMAINING_LENGTH);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// One complete, immutable MQTT control packet.
///
/// Holds the verbatim bytes received: header, length field and payload.
/// Cloning is cheap (reference-counted).
#[derive(Clone, PartialEq, Eq)]
pub struct Pdu {
    bytes: Bytes,
    /// Fixed header byte plus the remaining-length field.
    header_len: usize,
}

impl Pdu {
    /// Build from bytes already framed by the codec.
    pub(crate) fn from_framed(bytes: Bytes, header_len: usize) -> Self {
        debug_assert!(header_len >= 2 && header_len <= bytes.len());
        Self { bytes, header_len }
    }

    /// Wrap a buffer that must contain exactly one complete PDU.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Truncated`] if the buffer ends early,
    /// [`FrameError::LengthMismatch`] if it carries trailing bytes, and
    /// [`FrameError::RemainingLengthTooLong`] for a malformed length field.
    pub fn try_from_bytes(bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Truncated { buffered: 0 });
        }

        let (remaining, width) = decode_remaining_length(&bytes[1..])?.ok_or(
            FrameError::Truncated {
                buffered: bytes.len(),
            },
        )?;

        let header_len = 1 + width;
        let expected = header_len + remaining;
        if bytes.len() < expected {
            return Err(FrameError::Truncated {
                buffered: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        Ok(Self { bytes, header_len })
    }

    /// The raw bytes, exactly as received.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle to the raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the PDU, returning its raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Total size on the wire.
    #[allow(clippy::len_without_is_empty)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// The fixed header byte.
    #[must_use]
    pub fn header(&self) -> u8 {
        self.bytes[0]
    }

    /// Type-specific flags (low nibble of the fixed header).
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.bytes[0] & 0x0F
    }

    /// Message type from the high nibble of the fixed header.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        MessageType::from_header(self.bytes[0])
    }

    /// Width of the fixed header plus the remaining-length field.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Value of the remaining-length field.
    #[must_use]
    pub fn remaining_length(&self) -> usize {
        self.bytes.len() - self.header_len
    }

    /// Variable header and payload, without the fixed header.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }
}

impl AsRef<[u8]> for Pdu {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("message_type", &self.message_type())
            .field("flags", &self.flags())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_len(bytes: &[u8]) -> usize {
        decode_remaining_length(bytes).unwrap().unwrap().0
    }

    #[test]
    fn test_remaining_length_reference_values() {
        assert_eq!(decode_len(&[0x00]), 0);
        assert_eq!(decode_len(&[0x7F]), 127);
        assert_eq!(decode_len(&[0x80, 0x01]), 128);
        assert_eq!(decode_len(&[0xFF, 0x7F]), 16_383);
        assert_eq!(decode_len(&[0x80, 0x80, 0x01]), 16_384);
        assert_eq!(decode_len(&[0xFF, 0xFF, 0xFF, 0x7F]), MAX_REMAINING_LENGTH);
    }

    #[test]
    fn test_remaining_length_reports_width() {
        assert_eq!(decode_remaining_length(&[0x05]).unwrap(), Some((5, 1)));
        assert_eq!(
            decode_remaining_length(&[0x80, 0x01, 0xAA]).unwrap(),
            Some((128, 2))
        );
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert_eq!(decode_remaining_length(&[]).unwrap(), None);
        assert_eq!(decode_remaining_length(&[0x80]).unwrap(), None);
        assert_eq!(decode_remaining_length(&[0xFF, 0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn test_remaining_length_too_long() {
        let result = decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(result, Err(FrameError::RemainingLengthTooLong(4))));

        // Detected without waiting for a fifth byte.
        let result = decode_remaining_length(&[0x80, 0x80, 0x80, 0x80]);
        assert!(matches!(result, Err(FrameError::RemainingLengthTooLong(4))));
    }

    #[test]
    fn test_encode_remaining_length_boundaries() {
        for (value, expected) in [
            (0usize, vec![0x00]),
            (127, vec![0x7F]),
            (128, vec![0x80, 0x01]),
            (16_383, vec![0xFF, 0x7F]),
            (2_097_152, vec![0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, vec![0xFF, 0xFF, 0xFF, 0x7F]),
        ] {
            let mut buf = BytesMut::new();
            encode_remaining_length(value, &mut buf);
            assert_eq!(&buf[..], &expected[..], "encoding of {value}");
        }
    }

    #[test]
    fn test_try_from_bytes_pingreq() {
        let pdu = Pdu::try_from_bytes(Bytes::from_static(&[0xC0, 0x00])).unwrap();
        assert_eq!(pdu.message_type(), MessageType::PingReq);
        assert_eq!(pdu.len(), 2);
        assert_eq!(pdu.header_len(), 2);
        assert_eq!(pdu.remaining_length(), 0);
        assert!(pdu.body().is_empty());
    }

    #[test]
    fn test_try_from_bytes_publish_flags() {
        let pdu =
            Pdu::try_from_bytes(Bytes::from_static(&[0x32, 0x03, 0x00, 0x01, b'a'])).unwrap();
        assert_eq!(pdu.message_type(), MessageType::Publish);
        assert_eq!(pdu.flags(), 0x02);
        assert_eq!(pdu.body(), &[0x00, 0x01, b'a']);
    }

    #[test]
    fn test_try_from_bytes_truncated() {
        let result = Pdu::try_from_bytes(Bytes::from_static(&[0x30, 0x05, 0x00]));
        assert!(matches!(result, Err(FrameError::Truncated { buffered: 3 })));

        let result = Pdu::try_from_bytes(Bytes::new());
        assert!(matches!(result, Err(FrameError::Truncated { buffered: 0 })));
    }

    #[test]
    fn test_try_from_bytes_trailing_data() {
        let result = Pdu::try_from_bytes(Bytes::from_static(&[0xC0, 0x00, 0xD0, 0x00]));
        assert!(matches!(
            result,
            Err(FrameError::LengthMismatch {
                expected: 2,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_debug_does_not_dump_payload() {
        let pdu = Pdu::try_from_bytes(Bytes::from_static(&[0xE0, 0x00])).unwrap();
        let debug = format!("{pdu:?}");
        assert!(debug.contains("Disconnect"));
        assert!(debug.contains("len: 2"));
    }
}
