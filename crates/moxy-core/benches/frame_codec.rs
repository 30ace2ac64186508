//! Performance benchmarks for PDU framing and decoding.
//!
//! Measures throughput of the frame codec over streams of mixed PDUs and the
//! cost of decoding CONNECT fields.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio_util::codec::Decoder;

use moxy_core::network::MqttCodec;
use moxy_core::protocol::{decode, Pdu};
use moxy_core::sinks::hex_dump;
use moxy_core::testing::packets;

/// A stream of `count` PUBLISH packets with `payload` byte payloads.
fn publish_stream(count: usize, payload: usize) -> Bytes {
    let body = vec![0x5A; payload];
    let mut buf = BytesMut::new();
    for i in 0..count {
        buf.extend_from_slice(&packets::publish("bench/topic", &body, 1, i as u16));
    }
    buf.freeze()
}

/// Benchmark splitting a buffered stream into PDUs.
fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    for payload in [16usize, 256, 4096, 65536] {
        let stream = publish_stream(64, payload);

        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("publish_x64", payload),
            &stream,
            |b, stream| {
                b.iter(|| {
                    let mut codec = MqttCodec::new();
                    let mut buf = BytesMut::from(&stream[..]);
                    while let Some(pdu) = codec.decode(&mut buf).unwrap() {
                        black_box(pdu);
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark CONNECT field decoding.
fn bench_connect_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("connect_decode");

    let plain = Pdu::try_from_bytes(packets::connect("bench-client")).unwrap();
    let full = Pdu::try_from_bytes(
        packets::ConnectBuilder::new("bench-client")
            .will("status/bench-client", b"offline".to_vec(), 1, true)
            .username("bench")
            .password(b"secret".to_vec())
            .build(),
    )
    .unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("minimal", |b| {
        b.iter(|| black_box(decode(black_box(&plain)).unwrap()));
    });
    group.bench_function("will_and_credentials", |b| {
        b.iter(|| black_box(decode(black_box(&full)).unwrap()));
    });

    group.finish();
}

/// Benchmark the console hex dump.
fn bench_hex_dump(c: &mut Criterion) {
    let mut group = c.benchmark_group("hex_dump");

    for size in [64usize, 1024, 16384] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(hex_dump(data)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_framing, bench_connect_decode, bench_hex_dump);
criterion_main!(benches);
