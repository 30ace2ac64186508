//! Relay pipeline tests over in-memory streams: two pipelines wired the way a
//! session wires them, sharing one cancellation token and one trace file.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{duplex, split, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use moxy_core::network::{Direction, RelayEnd, RelayPipeline};
use moxy_core::sinks::{ConsoleSink, TraceRecorder};
use moxy_core::testing::packets;

/// Write target that can be inspected after the sink is moved away.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_pipeline_pair_relays_and_records() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = TraceRecorder::open(dir.path().join("pair.trace"))
        .await
        .unwrap();
    let console = SharedBuf::default();
    let cancel = CancellationToken::new();

    let (mut client, proxy_client) = duplex(4096);
    let (proxy_broker, mut broker) = duplex(4096);
    let (client_r, client_w) = split(proxy_client);
    let (broker_r, broker_w) = split(proxy_broker);

    let upstream = RelayPipeline::new(Direction::ClientToBroker)
        .with_sink(ConsoleSink::new(console.clone()))
        .with_sink(recorder.clone())
        .with_cancellation(cancel.clone());
    let downstream = RelayPipeline::new(Direction::BrokerToClient)
        .with_sink(ConsoleSink::new(console.clone()))
        .with_cancellation(cancel.clone());

    let upstream = tokio::spawn(upstream.run(client_r, broker_w));
    let downstream = tokio::spawn(downstream.run(broker_r, client_w));

    let connect = packets::connect("dev1");
    client.write_all(&connect).await.unwrap();
    let mut buf = vec![0u8; connect.len()];
    broker.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, connect.to_vec());

    broker.write_all(&packets::connack(0)).await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf.to_vec(), packets::connack(0).to_vec());

    // Client goes away; both directions must stop
    drop(client);
    let up = upstream.await.unwrap().unwrap();
    let down = downstream.await.unwrap().unwrap();
    assert_eq!(up.end, RelayEnd::EndOfStream);
    assert_eq!(down.end, RelayEnd::Cancelled);
    assert!(cancel.is_cancelled());

    recorder.close().await.unwrap();
    let trace = std::fs::read_to_string(recorder.path()).unwrap();
    assert_eq!(trace.matches("#########").count(), 1);

    let text = console.text();
    assert!(text.contains("SENT: CONNECT (18 bytes)\n"));
    assert!(text.contains("CONNECT: protocol=\"MQTT\" version=4"));
    assert!(text.contains("RCVD: CONNACK (4 bytes)\n"));

    // Broker side sees the close too
    let mut rest = Vec::new();
    broker.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_recorder_failure_does_not_stop_relay() {
    let dir = tempfile::TempDir::new().unwrap();
    let recorder = TraceRecorder::open(dir.path().join("closed.trace"))
        .await
        .unwrap();
    // Every save now fails
    recorder.close().await.unwrap();

    let input = [packets::connect("dev1"), packets::pingreq()].concat();
    let (dest_w, mut dest_r) = duplex(4096);
    let stats = RelayPipeline::new(Direction::ClientToBroker)
        .with_sink(recorder)
        .run(&input[..], dest_w)
        .await
        .unwrap();

    let mut out = Vec::new();
    dest_r.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, input);
    assert_eq!(stats.pdus, 2);
}

#[tokio::test]
async fn test_console_dump_format() {
    let console = SharedBuf::default();
    let input = packets::pingreq();
    let (dest_w, _dest_r) = duplex(64);

    RelayPipeline::new(Direction::ClientToBroker)
        .with_sink(ConsoleSink::new(console.clone()))
        .run(&input[..], dest_w)
        .await
        .unwrap();

    assert_eq!(
        console.text(),
        "SENT: PINGREQ (2 bytes)\n00000000  c0 00                                             |..|\n"
    );
}
