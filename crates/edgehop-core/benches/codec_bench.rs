//! Criterion benchmarks for the Edgehop frame codec.
//!
//! Input events dominate the wire: a mouse drag produces hundreds of `DMMV`
//! frames per second, each of which is encoded on the dispatcher thread.
//! These benchmarks keep an eye on the per-message cost.
//!
//! Run with:
//! ```bash
//! cargo bench --package edgehop-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use edgehop_core::protocol::frame::frame_bytes;
use edgehop_core::{decode_message, encode_message, Message};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn fixtures() -> Vec<(&'static str, Message)> {
    vec![
        ("Noop", Message::Noop),
        ("KeepAlive", Message::KeepAlive),
        (
            "Enter",
            Message::Enter {
                x: 1919,
                y: 540,
                seq: 12,
                mask: 0x2000,
            },
        ),
        ("Leave", Message::Leave),
        (
            "KeyDown",
            Message::KeyDown {
                key: 97,
                mask: 2,
                button: 38,
            },
        ),
        ("MouseMove", Message::MouseMove { x: 960, y: 540 }),
        (
            "MouseWheel",
            Message::MouseWheel {
                x_delta: 0,
                y_delta: -120,
            },
        ),
        (
            "ClipboardChunk(1KiB)",
            Message::ClipboardChunk {
                id: 0,
                seq: 3,
                mark: 2,
                payload: vec![0x41; 1024],
            },
        ),
        (
            "FileChunk(32KiB)",
            Message::FileChunk {
                mark: 2,
                payload: vec![0x42; 32 * 1024],
            },
        ),
        (
            "Info",
            Message::Info {
                x: 0,
                y: 0,
                w: 2560,
                h: 1440,
                zone: 0,
                mx: 1280,
                my: 720,
            },
        ),
        (
            "DragInfo",
            Message::DragInfo {
                file_count: 1,
                info: "report.pdf".to_string(),
            },
        ),
    ]
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");
    for (name, msg) in fixtures() {
        group.bench_with_input(BenchmarkId::new("msg", name), &msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_message");
    for (name, msg) in fixtures() {
        let bytes = encode_message(&msg);
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Full encode + frame + decode round-trip for the highest-frequency frames.
fn bench_roundtrip_hot_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_roundtrip");

    let mouse = Message::MouseMove { x: 100, y: 200 };
    group.bench_function("MouseMove", |b| {
        b.iter(|| {
            let framed = frame_bytes(&encode_message(black_box(&mouse)));
            decode_message(black_box(&framed[4..])).unwrap()
        })
    });

    let key = Message::KeyDown {
        key: 97,
        mask: 0,
        button: 38,
    };
    group.bench_function("KeyDown", |b| {
        b.iter(|| {
            let framed = frame_bytes(&encode_message(black_box(&key)));
            decode_message(black_box(&framed[4..])).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip_hot_path);
criterion_main!(benches);
