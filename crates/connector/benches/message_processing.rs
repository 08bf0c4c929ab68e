//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths of a live session:
//! - Inbound text frame parsing and correlation
//! - Binary frame decoding
//! - Engine dispatch of replies and topic traffic

use std::sync::Arc;

use connector::channel::{ChannelEngine, ChannelTransport};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use protocol::error::ChannelError;
use protocol::framing::{encode_frame, Calibration, DecompressError, FrameDecoder, VoxelMesh};
use protocol::messages::{correlation_id, ChannelMessage};
use serde_json::json;

/// Transport that accepts and discards everything.
struct NullTransport;

impl ChannelTransport for NullTransport {
    fn is_open(&self) -> bool {
        true
    }

    fn send_text(&self, _text: String) -> Result<(), ChannelError> {
        Ok(())
    }
}

fn stub_decoder() -> FrameDecoder {
    FrameDecoder::new(Arc::new(
        |payload: &[u8], _: &Calibration| -> Result<VoxelMesh, DecompressError> {
            Ok(VoxelMesh {
                point_count: payload.len() as u32,
                ..VoxelMesh::default()
            })
        },
    ))
}

/// Benchmark parsing of typical inbound text frames.
fn bench_message_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_parsing");

    // Small control message
    let heartbeat = json!({
        "type": "heartbeat",
        "topic": "",
        "data": {"timeInStr": "2026-10-18 12:00:00", "timeInNum": 1_792_324_800},
    })
    .to_string();
    group.throughput(Throughput::Bytes(heartbeat.len() as u64));
    group.bench_function("heartbeat", |b| {
        b.iter(|| ChannelMessage::from_json(black_box(&heartbeat)))
    });

    // Request reply
    let reply = json!({
        "type": "res",
        "topic": "rt/api/sport/request",
        "data": {"header": {"identity": {"id": 1_234_567, "api_id": 1016}, "status": {"code": 0}}, "data": ""},
    })
    .to_string();
    group.throughput(Throughput::Bytes(reply.len() as u64));
    group.bench_function("response", |b| {
        b.iter(|| ChannelMessage::from_json(black_box(&reply)))
    });

    // Telemetry (state report with a few hundred numbers)
    let motor_state: Vec<_> = (0..20)
        .map(|i| json!({"q": i as f64 * 0.01, "dq": 0.0, "tau_est": 0.1, "temperature": 40}))
        .collect();
    let lowstate = json!({
        "type": "msg",
        "topic": "rt/lf/lowstate",
        "data": {"motor_state": motor_state, "bms_state": {"soc": 87}, "foot_force": [10, 12, 11, 9]},
    })
    .to_string();
    group.throughput(Throughput::Bytes(lowstate.len() as u64));
    group.bench_function("lowstate", |b| {
        b.iter(|| ChannelMessage::from_json(black_box(&lowstate)))
    });

    group.finish();
}

/// Benchmark correlation id extraction.
fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");

    let by_uuid = json!({"uuid": "c0ffee", "header": {"identity": {"id": 7}}});
    group.bench_function("uuid", |b| b.iter(|| correlation_id(black_box(&by_uuid))));

    let by_identity = json!({"header": {"identity": {"id": 1_234_567, "api_id": 1016}}});
    group.bench_function("identity", |b| {
        b.iter(|| correlation_id(black_box(&by_identity)))
    });

    let none = json!({"lx": 0.0, "ly": 0.5});
    group.bench_function("absent", |b| b.iter(|| correlation_id(black_box(&none))));

    group.finish();
}

/// Benchmark binary frame decoding.
fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let decoder = stub_decoder();

    let header = json!({
        "type": "msg",
        "topic": "rt/utlidar/voxel_map_compressed",
        "data": {"origin": [-3.2, 1.5, 0.0], "resolution": 0.05, "width": [128, 128, 38]},
    });

    for (name, size) in [("payload_1KB", 1024usize), ("payload_64KB", 65536)] {
        let frame = encode_frame(&header, &vec![0u8; size]).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(name, |b| b.iter(|| decoder.decode(black_box(&frame))));
    }

    group.finish();
}

/// Benchmark engine dispatch of inbound frames.
fn bench_engine_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_dispatch");
    let engine = ChannelEngine::new(Arc::new(NullTransport), stub_decoder());

    // Subscribed topic traffic; the stream is drained each iteration
    let mut stream = engine.subscribe("rt/lf/lowstate").unwrap();
    let message = json!({"type": "msg", "topic": "rt/lf/lowstate", "data": {"tick": 1}}).to_string();
    group.bench_function("subscribed_topic", |b| {
        b.iter(|| {
            engine.handle_text(black_box(&message));
            stream.try_recv().ok()
        })
    });

    // Unmatched reply with nobody waiting
    let reply = json!({
        "type": "res",
        "topic": "rt/api/sport/request",
        "data": {"header": {"identity": {"id": 99, "api_id": 1016}}},
    })
    .to_string();
    group.bench_function("unmatched_reply", |b| {
        b.iter(|| engine.handle_text(black_box(&reply)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_message_parsing,
    bench_correlation,
    bench_frame_decode,
    bench_engine_dispatch,
);
criterion_main!(benches);
