//! Builders for MQTT 3.1.1 control packets used in tests and benchmarks.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::encode_remaining_length;

fn packet(header: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(header);
    encode_remaining_length(body.len(), &mut buf);
    buf.extend_from_slice(body);
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value);
}

/// CONNECT packet builder.
#[derive(Debug, Clone)]
pub struct ConnectBuilder {
    protocol_name: String,
    protocol_version: u8,
    clean_session: bool,
    keep_alive: u16,
    client_id: String,
    will: Option<(String, Vec<u8>, u8, bool)>,
    username: Option<String>,
    password: Option<Vec<u8>>,
}

impl ConnectBuilder {
    /// MQTT 3.1.1 CONNECT with clean session set and no will or credentials.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_version: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn protocol(mut self, name: impl Into<String>, version: u8) -> Self {
        self.protocol_name = name.into();
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn will(
        mut self,
        topic: impl Into<String>,
        message: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> Self {
        self.will = Some((topic.into(), message.into(), qos, retain));
        self
    }

    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Connect flags byte implied by the builder's settings.
    #[must_use]
    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some((_, _, qos, retain)) = &self.will {
            flags |= 0x04 | ((qos & 0x03) << 3);
            if *retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        flags
    }

    /// Encode the packet.
    #[must_use]
    pub fn build(&self) -> Bytes {
        let mut body = BytesMut::new();
        put_str(&mut body, self.protocol_name.as_bytes());
        body.put_u8(self.protocol_version);
        body.put_u8(self.flags());
        body.put_u16(self.keep_alive);
        put_str(&mut body, self.client_id.as_bytes());
        if let Some((topic, message, _, _)) = &self.will {
            put_str(&mut body, topic.as_bytes());
            put_str(&mut body, message);
        }
        if let Some(username) = &self.username {
            put_str(&mut body, username.as_bytes());
        }
        if let Some(password) = &self.password {
            put_str(&mut body, password);
        }
        packet(0x10, &body)
    }
}

/// CONNECT for `client_id` with clean session and a 60 second keep-alive.
#[must_use]
pub fn connect(client_id: &str) -> Bytes {
    ConnectBuilder::new(client_id).build()
}

/// CONNACK with the given return code.
#[must_use]
pub fn connack(return_code: u8) -> Bytes {
    packet(0x20, &[0x00, return_code])
}

/// PUBLISH; `packet_id` is written only for QoS 1 and 2.
#[must_use]
pub fn publish(topic: &str, payload: &[u8], qos: u8, packet_id: u16) -> Bytes {
    let mut body = BytesMut::new();
    put_str(&mut body, topic.as_bytes());
    if qos > 0 {
        body.put_u16(packet_id);
    }
    body.extend_from_slice(payload);
    packet(0x30 | ((qos & 0x03) << 1), &body)
}

/// PUBACK for `packet_id`.
#[must_use]
pub fn puback(packet_id: u16) -> Bytes {
    packet(0x40, &packet_id.to_be_bytes())
}

/// SUBSCRIBE to a single topic filter.
#[must_use]
pub fn subscribe(packet_id: u16, filter: &str, qos: u8) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    put_str(&mut body, filter.as_bytes());
    body.put_u8(qos);
    packet(0x82, &body)
}

/// SUBACK granting one return code per filter.
#[must_use]
pub fn suback(packet_id: u16, granted: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    body.extend_from_slice(granted);
    packet(0x90, &body)
}

#[must_use]
pub fn pingreq() -> Bytes {
    packet(0xC0, &[])
}

#[must_use]
pub fn pingresp() -> Bytes {
    packet(0xD0, &[])
}

#[must_use]
pub fn disconnect() -> Bytes {
    packet(0xE0, &[])
}
