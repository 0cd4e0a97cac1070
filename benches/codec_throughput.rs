//! Mailbox codec throughput benchmark.
//!
//! Measures envelope encode/decode and framed read/write round-trips
//! using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pulsar_core::mailbox::codec::{read_envelope, write_envelope};
use pulsar_core::mailbox::MessageEnvelope;
use pulsar_core::types::{ActorIdentity, ActorKind, CorrelationId};
use serde_json::json;
use std::io::Cursor;

const MAX_FRAME: u32 = 5 * 1024 * 1024;

fn envelope(size: usize) -> MessageEnvelope {
    MessageEnvelope::call(
        ActorIdentity::new(ActorKind::Actor, "bench-client"),
        ActorIdentity::new(ActorKind::Actor, "bench-server"),
        "process",
        json!({ "blob": "x".repeat(size), "seq": 42 }),
        CorrelationId::new(),
    )
}

fn bench_encode(c: &mut Criterion) {
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("envelope_encode");
    for &size in payload_sizes {
        let env = envelope(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &env, |b, e| {
            b.iter(|| black_box(e).encode().unwrap());
        });
    }
    group.finish();
}

fn bench_read_envelope(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("read_envelope");
    for &size in payload_sizes {
        // Pre-build the wire frame
        let wire = rt.block_on(async {
            let mut buf = Vec::new();
            write_envelope(&mut buf, &envelope(size)).await.unwrap();
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    read_envelope(&mut cursor, MAX_FRAME).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let env = envelope(1024);

    c.bench_function("round_trip_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut buf = Vec::with_capacity(1200);
                write_envelope(&mut buf, black_box(&env)).await.unwrap();
                let mut cursor = Cursor::new(buf);
                read_envelope(&mut cursor, MAX_FRAME).await.unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_encode, bench_read_envelope, bench_round_trip);
criterion_main!(benches);
