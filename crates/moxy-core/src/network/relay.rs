//! One direction of a proxied session.
//!
//! A [`RelayPipeline`] reads complete PDUs from its source, shows each one to
//! its sinks, and writes it unchanged to its destination. It stops on a clean
//! end of stream, on the first framing, decode or write failure, or when its
//! cancellation token fires. Whatever the cause, it cancels the token on the
//! way out so the opposite pipeline stops too.

use std::fmt;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::protocol::{decode, DecodedPdu, Pdu};
use crate::sinks::{PduObservation, PduSink};

use super::codec::{FrameReader, MqttCodec};

/// Which leg of a session a pipeline serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream broker.
    ClientToBroker,
    /// Upstream broker to client.
    BrokerToClient,
}

impl Direction {
    /// Console label: `SENT` for client to broker, `RCVD` for broker to client.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ClientToBroker => "SENT",
            Self::BrokerToClient => "RCVD",
        }
    }

    /// Identifier used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientToBroker => "client_to_broker",
            Self::BrokerToClient => "broker_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pipeline stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The source closed between PDUs.
    EndOfStream,
    /// The cancellation token fired.
    Cancelled,
}

/// Counters for one finished pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub direction: Direction,
    pub pdus: u64,
    pub bytes: u64,
    pub end: RelayEnd,
}

impl RelayStats {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            pdus: 0,
            bytes: 0,
            end: RelayEnd::EndOfStream,
        }
    }
}

/// Reads PDUs from one stream and forwards them to another.
pub struct RelayPipeline {
    direction: Direction,
    sinks: Vec<Box<dyn PduSink>>,
    codec: MqttCodec,
    cancel: CancellationToken,
    metrics: Option<Arc<ProxyMetrics>>,
    verbose: bool,
}

impl RelayPipeline {
    /// Create a pipeline with no sinks and its own cancellation token.
    #[must_use]
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            sinks: Vec::new(),
            codec: MqttCodec::new(),
            cancel: CancellationToken::new(),
            metrics: None,
            verbose: false,
        }
    }

    /// Add a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: impl PduSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Add several sinks, in order.
    #[must_use]
    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Box<dyn PduSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    /// Use a specific codec configuration.
    #[must_use]
    pub fn with_codec(mut self, codec: MqttCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Share a cancellation token with the opposite pipeline.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record relayed traffic.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Log every forwarded PDU's size at debug level.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Direction served by this pipeline.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Names of the attached sinks.
    #[must_use]
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Token cancelled when this pipeline stops.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Relay PDUs from `source` to `destination` until either side closes.
    ///
    /// A PDU write is never interrupted by cancellation, so the destination
    /// only ever sees whole PDUs.
    ///
    /// # Errors
    ///
    /// Returns a framing error for malformed or truncated input, a decode
    /// error for a CONNECT whose fields overrun the PDU, and a connection
    /// error when reading or writing fails.
    #[instrument(skip_all, fields(direction = %self.direction))]
    pub async fn run<R, W>(mut self, source: R, destination: W) -> Result<RelayStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = FrameReader::with_codec(source, self.codec.clone());
        let mut writer = FramedWrite::new(destination, self.codec.clone());
        let mut stats = RelayStats::new(self.direction);

        let result = self.relay(&mut reader, &mut writer, &mut stats).await;

        self.flush_sinks().await;
        if let Err(e) = writer.close().await {
            debug!(error = %e, "destination already closed");
        }
        self.cancel.cancel();

        match &result {
            Ok(()) => debug!(
                pdus = stats.pdus,
                bytes = stats.bytes,
                end = ?stats.end,
                "relay finished"
            ),
            Err(e) => debug!(
                pdus = stats.pdus,
                bytes = stats.bytes,
                error = %e,
                "relay failed"
            ),
        }

        result.map(|()| stats)
    }

    async fn relay<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FramedWrite<W, MqttCodec>,
        stats: &mut RelayStats,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    stats.end = RelayEnd::Cancelled;
                    return Ok(());
                }
                next = reader.next_pdu() => next?,
            };

            let Some(pdu) = next else {
                stats.end = RelayEnd::EndOfStream;
                return Ok(());
            };

            let decoded = decode(&pdu)?;
            self.observe(&pdu, &decoded).await;

            let len = pdu.len();
            writer.send(pdu).await?;

            if self.verbose {
                debug!(bytes = len, "wrote {len} bytes");
            }
            stats.pdus += 1;
            stats.bytes += len as u64;
            if let Some(metrics) = &self.metrics {
                metrics.record_pdu(self.direction.as_str(), decoded.message_type.name(), len);
            }
        }
    }

    async fn observe(&mut self, pdu: &Pdu, decoded: &DecodedPdu) {
        let observation = PduObservation {
            direction: self.direction,
            pdu,
            decoded,
        };

        for sink in &mut self.sinks {
            if let Err(e) = sink.accept(&observation).await {
                warn!(sink = sink.name(), error = %e, "sink failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sink_error(sink.name());
                }
            }
        }
    }

    async fn flush_sinks(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.flush().await {
                warn!(sink = sink.name(), error = %e, "sink flush failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sink_error(sink.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProxyError, SinkError};
    use crate::protocol::MessageType;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const CONNECT_DEV1: &[u8] = &[
        0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04, b'd',
        b'e', b'v', b'1',
    ];
    const PINGREQ: &[u8] = &[0xC0, 0x00];
    const DISCONNECT: &[u8] = &[0xE0, 0x00];

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<(Direction, MessageType, usize)>>>);

    #[async_trait]
    impl PduSink for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        async fn accept(
            &mut self,
            observation: &PduObservation<'_>,
        ) -> std::result::Result<(), SinkError> {
            self.0.lock().unwrap().push((
                observation.direction,
                observation.decoded.message_type,
                observation.pdu.len(),
            ));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PduSink for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn accept(
            &mut self,
            _observation: &PduObservation<'_>,
        ) -> std::result::Result<(), SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        }
    }

    fn stream(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    async fn relay_all(
        pipeline: RelayPipeline,
        input: Vec<u8>,
    ) -> (crate::error::Result<RelayStats>, Vec<u8>) {
        let (dest_w, mut dest_r) = duplex(64 * 1024);
        let result = pipeline.run(&input[..], dest_w).await;
        let mut out = Vec::new();
        dest_r.read_to_end(&mut out).await.unwrap();
        (result, out)
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(Direction::ClientToBroker.label(), "SENT");
        assert_eq!(Direction::BrokerToClient.label(), "RCVD");
        assert_eq!(Direction::ClientToBroker.to_string(), "client_to_broker");
    }

    #[tokio::test]
    async fn test_relay_forwards_identical_bytes() {
        let input = stream(&[CONNECT_DEV1, PINGREQ, DISCONNECT]);
        let collect = Collect::default();
        let pipeline = RelayPipeline::new(Direction::ClientToBroker).with_sink(collect.clone());

        let (result, out) = relay_all(pipeline, input.clone()).await;
        let stats = result.unwrap();

        assert_eq!(out, input);
        assert_eq!(stats.pdus, 3);
        assert_eq!(stats.bytes, input.len() as u64);
        assert_eq!(stats.end, RelayEnd::EndOfStream);

        let seen = collect.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (Direction::ClientToBroker, MessageType::Connect, 18),
                (Direction::ClientToBroker, MessageType::PingReq, 2),
                (Direction::ClientToBroker, MessageType::Disconnect, 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_empty_stream() {
        let pipeline = RelayPipeline::new(Direction::BrokerToClient);
        let token = pipeline.cancellation_token();

        let (result, out) = relay_all(pipeline, Vec::new()).await;
        assert_eq!(result.unwrap().pdus, 0);
        assert!(out.is_empty());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_forwarding() {
        let input = stream(&[PINGREQ, PINGREQ]);
        let metrics = Arc::new(ProxyMetrics::new());
        let pipeline = RelayPipeline::new(Direction::ClientToBroker)
            .with_sink(Failing)
            .with_metrics(Arc::clone(&metrics));

        let (result, out) = relay_all(pipeline, input.clone()).await;
        assert_eq!(result.unwrap().pdus, 2);
        assert_eq!(out, input);
        assert_eq!(metrics.sink_errors.with_label_values(&["failing"]).get(), 2);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_framing_error() {
        let input = stream(&[PINGREQ, &CONNECT_DEV1[..9]]);
        let pipeline = RelayPipeline::new(Direction::ClientToBroker);
        let token = pipeline.cancellation_token();

        let (result, out) = relay_all(pipeline, input).await;
        assert!(matches!(result, Err(ProxyError::Framing(_))));
        // The whole PDU before the truncation still went through
        assert_eq!(out, PINGREQ);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_connect_overrun_is_decode_error() {
        // Client id claims 16 bytes, 4 present
        let mut bad = CONNECT_DEV1.to_vec();
        bad[13] = 0x10;
        let input = stream(&[PINGREQ, &bad[..]]);
        let pipeline = RelayPipeline::new(Direction::ClientToBroker);

        let (result, out) = relay_all(pipeline, input).await;
        assert!(matches!(result, Err(ProxyError::Decode(_))));
        assert_eq!(out, PINGREQ);
    }

    #[tokio::test]
    async fn test_relay_records_metrics() {
        let input = stream(&[CONNECT_DEV1, PINGREQ]);
        let metrics = Arc::new(ProxyMetrics::new());
        let pipeline =
            RelayPipeline::new(Direction::ClientToBroker).with_metrics(Arc::clone(&metrics));

        let (result, _) = relay_all(pipeline, input).await;
        result.unwrap();

        assert_eq!(
            metrics
                .pdus_total
                .with_label_values(&["client_to_broker", "CONNECT"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .bytes_total
                .with_label_values(&["client_to_broker"])
                .get(),
            20
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_pipeline() {
        let (mut src_w, src_r) = duplex(1024);
        let (dest_w, mut dest_r) = duplex(1024);
        let cancel = CancellationToken::new();
        let pipeline =
            RelayPipeline::new(Direction::BrokerToClient).with_cancellation(cancel.clone());

        let task = tokio::spawn(pipeline.run(src_r, dest_w));

        src_w.write_all(PINGREQ).await.unwrap();
        let mut buf = [0u8; 2];
        dest_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, PINGREQ);

        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.end, RelayEnd::Cancelled);
        assert_eq!(stats.pdus, 1);
    }

    #[tokio::test]
    async fn test_with_sinks_keeps_order() {
        let sinks: Vec<Box<dyn PduSink>> = vec![Box::new(Failing), Box::new(Collect::default())];
        let pipeline = RelayPipeline::new(Direction::ClientToBroker).with_sinks(sinks);
        assert_eq!(pipeline.sink_names(), vec!["failing", "collect"]);
    }
}
