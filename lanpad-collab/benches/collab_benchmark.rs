use std::hint::black_box;
use std::net::SocketAddr;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};
use lanpad_collab::codec::{decode_operation, encode_operation, encode_snapshot, Reassembler};
use lanpad_collab::{
    ChannelCollaborator, ConflictResolution, Envelope, Framing, JoinDecision, SessionConfig,
    SessionEngine, WireMessage,
};
use lanpad_core::{ClientId, RgaStore};

fn peer() -> SocketAddr {
    "10.0.0.2:5005".parse().unwrap()
}

fn document(len: usize) -> RgaStore {
    let mut store = RgaStore::with_client(ClientId::new());
    let text: String = (0..len).map(|i| char::from(b'a' + (i * 7 % 26) as u8)).collect();
    store.replace_text(&text).unwrap();
    store
}

fn bench_operation_codec(c: &mut Criterion) {
    let mut store = document(100);
    let op = store.insert_at(50, 'x').unwrap();
    let binary = encode_operation(&op, Framing::Binary).unwrap();
    let text = encode_operation(&op, Framing::Text).unwrap();

    c.bench_function("op_encode_binary", |b| {
        b.iter(|| black_box(encode_operation(black_box(&op), Framing::Binary).unwrap()))
    });
    c.bench_function("op_decode_binary", |b| {
        b.iter(|| black_box(decode_operation(black_box(&binary), Framing::Binary).unwrap()))
    });
    c.bench_function("op_decode_text", |b| {
        b.iter(|| black_box(decode_operation(black_box(&text), Framing::Text).unwrap()))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let snapshot = document(10_000).snapshot();
    let budget = SessionConfig::default().chunk_payload_budget();

    c.bench_function("snapshot_encode_10k", |b| {
        b.iter(|| black_box(encode_snapshot(black_box(&snapshot), budget).unwrap()))
    });
}

fn bench_reassembly(c: &mut Criterion) {
    let snapshot = document(10_000).snapshot();
    let chunks: Vec<_> = encode_snapshot(&snapshot, 1104)
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            WireMessage::Chunk(chunk) => Some(chunk),
            _ => None,
        })
        .collect();

    c.bench_function("reassemble_10k_reversed", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new();
            let now = Instant::now();
            let mut done = None;
            for chunk in chunks.iter().rev().cloned() {
                done = reassembler.feed(peer(), chunk, now).unwrap();
            }
            black_box(done)
        })
    });
}

fn bench_engine_ingest(c: &mut Criterion) {
    let mut source = RgaStore::with_client(ClientId::new());
    let sender = source.client();
    let datagrams: Vec<Vec<u8>> = (0..1_000)
        .map(|i| {
            let op = source.insert_at(i, 'z').unwrap();
            Envelope::new(sender, WireMessage::from(op))
                .encode(Framing::Binary)
                .unwrap()
        })
        .collect();

    c.bench_function("engine_ingest_1k_ops", |b| {
        b.iter(|| {
            let (collab, _rx) =
                ChannelCollaborator::new(JoinDecision::Accept, ConflictResolution::Discard, 1);
            let mut engine = SessionEngine::new(
                SessionConfig::named("bench"),
                "10.0.0.1:5005".parse().unwrap(),
                Box::new(collab),
            );
            engine.share().unwrap();
            let now = Instant::now();
            for bytes in &datagrams {
                black_box(engine.handle_datagram(bytes, peer(), now));
            }
            black_box(engine.text().len())
        })
    });
}

criterion_group!(
    benches,
    bench_operation_codec,
    bench_snapshot_encode,
    bench_reassembly,
    bench_engine_ingest,
);
criterion_main!(benches);
