//! MQTT control packet types.

use std::fmt;

/// Control packet type carried in the high nibble of the fixed header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 0x0, never valid on the wire.
    Reserved0 = 0,
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    /// 0xF, reserved in MQTT 3.1.1.
    Reserved15 = 15,
}

impl MessageType {
    /// Derive the message type from a fixed header byte.
    ///
    /// Total over all inputs: the low nibble (packet flags) is ignored.
    #[must_use]
    pub const fn from_header(header: u8) -> Self {
        match header >> 4 {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            15 => Self::Reserved15,
            _ => Self::Reserved0,
        }
    }

    /// Upper-case protocol name, as printed by the console dump.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
            Self::Reserved0 | Self::Reserved15 => "RESERVED",
        }
    }

    /// Whether the nibble is one of the two reserved values.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved0 | Self::Reserved15)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message type of a fixed header byte.
#[must_use]
pub const fn decode_msgtype(header: u8) -> MessageType {
    MessageType::from_header(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_msgtype_examples() {
        assert_eq!(decode_msgtype(0x10), MessageType::Connect);
        assert_eq!(decode_msgtype(0x30), MessageType::Publish);
        assert_eq!(decode_msgtype(0xE0), MessageType::Disconnect);
    }

    #[test]
    fn test_flags_nibble_ignored() {
        // PUBLISH with QoS 1, retain
        assert_eq!(decode_msgtype(0x33), MessageType::Publish);
        // PUBREL carries mandatory flags 0b0010
        assert_eq!(decode_msgtype(0x62), MessageType::PubRel);
        assert_eq!(decode_msgtype(0x82), MessageType::Subscribe);
    }

    #[test]
    fn test_reserved_values() {
        assert_eq!(decode_msgtype(0x00), MessageType::Reserved0);
        assert_eq!(decode_msgtype(0xF0), MessageType::Reserved15);
        assert!(decode_msgtype(0x0F).is_reserved());
        assert!(decode_msgtype(0xFF).is_reserved());
        assert_eq!(MessageType::Reserved15.name(), "RESERVED");
    }

    #[test]
    fn test_every_nibble_round_trips_through_repr() {
        for nibble in 0u8..16 {
            let msg_type = decode_msgtype(nibble << 4);
            assert_eq!(msg_type as u8, nibble);
        }
    }

    #[test]
    fn test_display_uses_protocol_name() {
        assert_eq!(MessageType::PingResp.to_string(), "PINGRESP");
        assert_eq!(MessageType::Unsubscribe.to_string(), "UNSUBSCRIBE");
    }
}
