//! Read-only decoding of framed PDUs.
//!
//! Every PDU yields its message type. CONNECT PDUs additionally yield
//! [`ConnectFields`]: protocol name, version, flags, keep-alive, client id,
//! then the will topic/message, username and password, each present only
//! when its flag bit is set.
//!
//! Decoding works on an already buffered [`Pdu`] and never reads past its
//! end. A field that claims more bytes than remain is a [`DecodeError`].

use std::fmt;

use bytes::{Buf, Bytes};

use crate::error::DecodeError;

use super::message_type::MessageType;
use super::pdu::{decode_remaining_length, Pdu};

/// MQTT 5 inserts property blocks into the CONNECT variable header and will.
const PROTOCOL_VERSION_5: u8 = 5;

/// Result of decoding one PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPdu {
    /// Message type from the fixed header.
    pub message_type: MessageType,
    /// Structured fields, present only for CONNECT.
    pub connect: Option<ConnectFields>,
}

/// CONNECT flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags(pub u8);

impl ConnectFlags {
    /// Raw flags byte.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Bit 1.
    #[must_use]
    pub fn clean_session(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// Bit 2: will topic and will message follow the client id.
    #[must_use]
    pub fn will(self) -> bool {
        self.0 & 0x04 != 0
    }

    /// Bits 3-4.
    #[must_use]
    pub fn will_qos(self) -> u8 {
        (self.0 >> 3) & 0x03
    }

    /// Bit 5.
    #[must_use]
    pub fn will_retain(self) -> bool {
        self.0 & 0x20 != 0
    }

    /// Bit 6: a password follows.
    #[must_use]
    pub fn password(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// Bit 7: a username follows.
    #[must_use]
    pub fn username(self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// Decoded view of a CONNECT PDU. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFields {
    pub protocol_name: String,
    pub protocol_version: u8,
    pub flags: ConnectFlags,
    pub keep_alive: u16,
    pub client_id: String,
    pub will_topic: Option<String>,
    pub will_message: Option<Bytes>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl fmt::Display for ConnectFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol={:?} version={} flags=0x{:02x} keep_alive={} client_id={:?}",
            self.protocol_name,
            self.protocol_version,
            self.flags.bits(),
            self.keep_alive,
            self.client_id
        )?;
        if let Some(topic) = &self.will_topic {
            write!(f, " will_topic={topic:?}")?;
        }
        if let Some(message) = &self.will_message {
            write!(f, " will_message=<{} bytes>", message.len())?;
        }
        if let Some(username) = &self.username {
            write!(f, " username={username:?}")?;
        }
        // Credentials never reach the console, only their size.
        if let Some(password) = &self.password {
            write!(f, " password=<{} bytes>", password.len())?;
        }
        Ok(())
    }
}

/// Decode the message type and, for CONNECT, the structured fields.
///
/// # Errors
///
/// Returns [`DecodeError`] if a CONNECT field runs past the end of the PDU.
pub fn decode(pdu: &Pdu) -> Result<DecodedPdu, DecodeError> {
    let message_type = pdu.message_type();
    let connect = match message_type {
        MessageType::Connect => Some(decode_connect(pdu)?),
        _ => None,
    };
    Ok(DecodedPdu {
        message_type,
        connect,
    })
}

fn decode_connect(pdu: &Pdu) -> Result<ConnectFields, DecodeError> {
    let mut reader = FieldReader::new(pdu);

    let protocol_name = reader.string("protocol_name")?;
    let protocol_version = reader.u8("protocol_version")?;
    let flags = ConnectFlags(reader.u8("connect_flags")?);
    let keep_alive = reader.u16("keep_alive")?;

    if protocol_version == PROTOCOL_VERSION_5 {
        reader.skip_properties("connect_properties")?;
    }

    let client_id = reader.string("client_id")?;

    let (will_topic, will_message) = if flags.will() {
        if protocol_version == PROTOCOL_VERSION_5 {
            reader.skip_properties("will_properties")?;
        }
        (
            Some(reader.string("will_topic")?),
            Some(reader.binary("will_message")?),
        )
    } else {
        (None, None)
    };

    let username = if flags.username() {
        Some(reader.string("username")?)
    } else {
        None
    };

    let password = if flags.password() {
        Some(reader.binary("password")?)
    } else {
        None
    };

    Ok(ConnectFields {
        protocol_name,
        protocol_version,
        flags,
        keep_alive,
        client_id,
        will_topic,
        will_message,
        username,
        password,
    })
}

/// Cursor over the body of a PDU, bounded by the PDU's end.
struct FieldReader<'a> {
    pdu: &'a Pdu,
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(pdu: &'a Pdu) -> Self {
        Self {
            pdu,
            buf: pdu.body(),
        }
    }

    fn require(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.require(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        self.require(field, 2)?;
        Ok(self.buf.get_u16())
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        self.require(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Two big-endian length bytes followed by that many bytes.
    fn length_prefixed(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = usize::from(self.u16(field)?);
        self.take(field, len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.length_prefixed(field)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn binary(&mut self, field: &'static str) -> Result<Bytes, DecodeError> {
        let raw = self.length_prefixed(field)?;
        Ok(self.pdu.bytes().slice_ref(raw))
    }

    fn skip_properties(&mut self, field: &'static str) -> Result<(), DecodeError> {
        let (len, width) = decode_remaining_length(self.buf)
            .map_err(|_| DecodeError::MalformedVarInt { field })?
            .ok_or(DecodeError::Truncated {
                field,
                needed: 1,
                available: self.buf.remaining(),
            })?;
        self.buf.advance(width);
        self.take(field, len)?;
        Ok(())
    }
}
