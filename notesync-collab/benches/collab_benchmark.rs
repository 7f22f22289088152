use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use notesync_collab::{AwarenessState, BroadcastGroup, PeerInfo, SyncMessage};
use notesync_core::{Stroke, StrokeAdapter, TextAdapter, SharedDocument};
use uuid::Uuid;

fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("Protocol");
    let peer = Uuid::new_v4();
    let delta = vec![7u8; 256];

    group.throughput(Throughput::Bytes(delta.len() as u64));
    group.bench_function("update_encode_256B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), "note-bench", 1, black_box(delta.clone()));
            black_box(msg.encode().unwrap())
        })
    });

    let encoded = SyncMessage::update(peer, "note-bench", 1, delta.clone()).encode().unwrap();
    group.bench_function("update_decode_256B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });

    let state = AwarenessState::new(peer, "Bench");
    group.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(peer, "note-bench", 1, black_box(&state)).unwrap();
            black_box(msg.encode().unwrap())
        })
    });

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("Broadcast");

    for peers in [10usize, 100] {
        let room = BroadcastGroup::new(1024);
        let mut receivers = Vec::with_capacity(peers);
        runtime.block_on(async {
            for i in 0..peers {
                receivers.push(room.add_peer(PeerInfo::new(format!("peer-{i}"))).await);
            }
        });
        let frame = Arc::new(vec![0u8; 128]);

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_function(format!("fan_out_{peers}_peers"), |b| {
            b.iter(|| {
                black_box(room.broadcast_raw(None, frame.clone()));
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            })
        });
    }

    group.finish();
}

fn bench_delta_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Delta Apply");

    let source = Arc::new(SharedDocument::new("bench"));
    TextAdapter::new(source.clone())
        .sync_to_local(&"<p>collaborative text</p>".repeat(50))
        .unwrap();
    let strokes: Vec<Stroke> = (0..200).map(|i| Stroke::new(format!("s{i}"), "#333333", 1.5)).collect();
    StrokeAdapter::new(source.clone()).sync_to_local(&strokes).unwrap();
    let snapshot = source.encode_full_state().unwrap();

    group.throughput(Throughput::Bytes(snapshot.len() as u64));
    group.bench_function("apply_full_state", |b| {
        b.iter(|| {
            let replica = SharedDocument::new("bench");
            replica.apply_remote_delta(black_box(&snapshot)).unwrap();
            black_box(replica)
        })
    });

    group.bench_function("encode_diff_empty_sv", |b| {
        let empty_sv = SharedDocument::new("empty").state_vector().unwrap();
        b.iter(|| black_box(source.encode_diff(black_box(&empty_sv)).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_protocol, bench_broadcast, bench_delta_apply);
criterion_main!(benches);
