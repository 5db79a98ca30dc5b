//! Benchmarks for the sockudo-wire codec and connection state machine
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use sockudo_wire::frame::{FrameParser, OpCode, encode_frame};
use sockudo_wire::mask::apply_mask;
use sockudo_wire::utf8::{Utf8Stream, validate_utf8};
use sockudo_wire::{Config, Connection, Role};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            b.iter(|| apply_mask(black_box(&mut data), black_box(MASK)));
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    let mixed = "Hello, 世界! 🎉 ".repeat(200);
    group.throughput(Throughput::Bytes(mixed.len() as u64));

    group.bench_function("whole", |b| {
        b.iter(|| validate_utf8(black_box(mixed.as_bytes())));
    });

    // Same text arriving in 100-byte fragments, split mid-codepoint
    group.bench_function("streamed", |b| {
        let bytes = mixed.as_bytes();
        b.iter(|| {
            let mut stream = Utf8Stream::new();
            let mut end = 0;
            while end < bytes.len() {
                end = (end + 100).min(bytes.len());
                stream.feed(&bytes[..end]);
            }
            stream.finish(black_box(bytes))
        });
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    // One size per length tier
    for size in [100, 4096, 70_000] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_masked", size), &data, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                encode_frame(black_box(&mut buf), OpCode::Binary, black_box(data), true, Some(MASK))
            });
        });

        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Binary, &data, true, Some(MASK)).unwrap();
        let wire = wire.freeze();

        group.bench_with_input(BenchmarkId::new("parse_masked", size), &wire, |b, wire| {
            let mut parser = FrameParser::new(1024 * 1024);
            b.iter(|| {
                let mut buf = BytesMut::from(wire.as_ref());
                parser.parse(black_box(&mut buf)).unwrap()
            });
        });
    }

    group.finish();
}

/// Server receiving a fragmented text message through `Connection::feed`
fn bench_connection(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection");

    let text = "x".repeat(64 * 1024);
    let mut wire = BytesMut::new();
    let chunks: Vec<&[u8]> = text.as_bytes().chunks(4096).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
        encode_frame(&mut wire, opcode, chunk, i + 1 == chunks.len(), Some(MASK)).unwrap();
    }
    group.throughput(Throughput::Bytes(text.len() as u64));

    group.bench_function("feed_fragmented_text", |b| {
        let mut conn = Connection::accepted(Role::Server, Config::default());
        b.iter(|| conn.feed(black_box(&wire)));
    });

    group.finish();
}

criterion_group!(benches, bench_mask, bench_utf8, bench_codec, bench_connection);

criterion_main!(benches);
