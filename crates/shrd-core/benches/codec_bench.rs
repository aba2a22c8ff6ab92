//! Criterion benchmarks for the shared device wire codec.
//!
//! Measures header-only requests, uncompressed and zlib-compressed track
//! images, since READ replies dominate traffic on a busy shared device.
//!
//! Run with:
//! ```bash
//! cargo bench --package shrd-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shrd_core::protocol::{decode_message, encode_message, Command, CompressionSpec, Header, ResponseCode};

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// A 3390-sized track image: mostly zero-filled records with some structure.
fn make_track(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 512 < 16 { (i / 512) as u8 } else { 0 })
        .collect()
}

fn read_reply() -> Header {
    Header::response(ResponseCode::Ok, 0, 0x0190, 1)
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `encode_message` for a header-only request and for track images.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");

    let start = Header::request(Command::Start, 0, 0x0190, 1);
    group.bench_function("START", |b| {
        b.iter(|| encode_message(black_box(&start), black_box(&[]), None).expect("encode"))
    });

    let spec = CompressionSpec::zlib(6).with_offset(5);
    for size in [4096usize, 56_664] {
        let track = make_track(size);
        group.bench_with_input(BenchmarkId::new("plain", size), &track, |b, t| {
            b.iter(|| encode_message(black_box(&read_reply()), black_box(t), None).expect("encode"))
        });
        group.bench_with_input(BenchmarkId::new("zlib6", size), &track, |b, t| {
            b.iter(|| {
                encode_message(black_box(&read_reply()), black_box(t), Some(&spec)).expect("encode")
            })
        });
    }
    group.finish();
}

/// Benchmarks `decode_message` from pre-encoded bytes.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_message");
    let spec = CompressionSpec::zlib(6).with_offset(5);
    for size in [4096usize, 56_664] {
        let track = make_track(size);
        let plain = encode_message(&read_reply(), &track, None).expect("bench setup");
        let packed = encode_message(&read_reply(), &track, Some(&spec)).expect("bench setup");
        group.bench_with_input(BenchmarkId::new("plain", size), &plain, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode"))
        });
        group.bench_with_input(BenchmarkId::new("zlib6", size), &packed, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
