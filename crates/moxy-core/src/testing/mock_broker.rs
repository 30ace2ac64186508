//! Mock MQTT broker for integration testing.
//!
//! A lightweight mock broker that:
//! - Accepts MQTT connections
//! - Records every PDU received
//! - Returns configurable responses (CONNACK, PINGRESP, SUBACK, PUBACK by default)

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

use crate::network::FrameReader;
use crate::protocol::{MessageType, Pdu};

use super::packets;

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// Message type of the received PDU.
    pub message_type: MessageType,
    /// The raw PDU bytes, fixed header included.
    pub bytes: Bytes,
}

/// What the broker does after receiving a PDU.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write these bytes back.
    Send(Bytes),
    /// Stay silent.
    Nothing,
    /// Close the connection.
    Close,
}

/// Response generator function type.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Reply + Send + Sync>;

/// Mock MQTT broker for testing.
pub struct MockBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    response_handlers: Arc<RwLock<HashMap<MessageType, ResponseGenerator>>>,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
            accepted: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address.clone_from(&actual_address);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = self.call_log.clone();
        let response_handlers = self.response_handlers.clone();
        let accepted = self.accepted.clone();
        let closed = self.closed.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                accepted.fetch_add(1, Ordering::SeqCst);
                                let call_log = call_log.clone();
                                let response_handlers = response_handlers.clone();
                                let closed = closed.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                    closed.fetch_add(1, Ordering::SeqCst);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock broker, closing every open connection.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Register a response handler for a message type.
    pub async fn register_handler(&self, message_type: MessageType, handler: ResponseGenerator) {
        self.response_handlers
            .write()
            .await
            .insert(message_type, handler);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by message type.
    pub async fn get_calls_of_type(&self, message_type: MessageType) -> Vec<BrokerCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` calls are recorded or `timeout` elapses.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> Vec<BrokerCall> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls = self.get_calls().await;
            if calls.len() >= count || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` connections have closed or `timeout` elapses.
    pub async fn wait_for_closed(&self, count: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let closed = self.connections_closed();
            if closed >= count || tokio::time::Instant::now() >= deadline {
                return closed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Number of connections that have ended.
    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Handle a single client connection.
    async fn handle_connection(
        stream: TcpStream,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        response_handlers: Arc<RwLock<HashMap<MessageType, ResponseGenerator>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = reader.next_pdu() => {
                    let Ok(Some(pdu)) = result else {
                        // Closed or unframeable
                        break;
                    };

                    let call = BrokerCall {
                        message_type: pdu.message_type(),
                        bytes: pdu.bytes().clone(),
                    };
                    call_log.write().await.push(call.clone());

                    let reply = {
                        let handlers = response_handlers.read().await;
                        match handlers.get(&call.message_type) {
                            Some(handler) => handler(&call),
                            None => Self::default_response(&pdu),
                        }
                    };

                    match reply {
                        Reply::Send(bytes) => {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Reply::Nothing => {}
                        Reply::Close => break,
                    }
                }
            }
        }
    }

    /// Default broker behaviour for a received PDU.
    fn default_response(pdu: &Pdu) -> Reply {
        match pdu.message_type() {
            MessageType::Connect => Reply::Send(packets::connack(0)),
            MessageType::PingReq => Reply::Send(packets::pingresp()),
            MessageType::Subscribe => match subscribe_request(pdu.body()) {
                Some((packet_id, granted)) => Reply::Send(packets::suback(packet_id, &granted)),
                None => Reply::Nothing,
            },
            MessageType::Publish if (pdu.flags() >> 1) & 0x03 == 1 => {
                match publish_packet_id(pdu.body()) {
                    Some(packet_id) => Reply::Send(packets::puback(packet_id)),
                    None => Reply::Nothing,
                }
            }
            MessageType::Disconnect => Reply::Close,
            _ => Reply::Nothing,
        }
    }
}

/// Packet id of a QoS 1 PUBLISH body.
fn publish_packet_id(body: &[u8]) -> Option<u16> {
    let topic_len = usize::from(u16::from_be_bytes([*body.first()?, *body.get(1)?]));
    let id = body.get(2 + topic_len..4 + topic_len)?;
    Some(u16::from_be_bytes([id[0], id[1]]))
}

/// Packet id and requested QoS of each filter in a SUBSCRIBE body.
fn subscribe_request(body: &[u8]) -> Option<(u16, Vec<u8>)> {
    let packet_id = u16::from_be_bytes([*body.first()?, *body.get(1)?]);
    let mut rest = &body[2..];
    let mut granted = Vec::new();
    while !rest.is_empty() {
        let len = usize::from(u16::from_be_bytes([*rest.first()?, *rest.get(1)?]));
        granted.push(*rest.get(2 + len)? & 0x03);
        rest = &rest[3 + len..];
    }
    Some((packet_id, granted))
}
