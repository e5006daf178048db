//! Performance benchmarks for the payload codec and QR rendering
//!
//! Run with: cargo bench

use chartlink::capture::{CaptureConstraints, MediaCaptureController};
use chartlink::codec::{decode, encode, to_wire, PayloadKind};
use chartlink::pairing_qr::PairingQr;
use chartlink::testing::SyntheticCameraProvider;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

/// Document-like payload with some structure
fn generate_document(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Envelope");
    group.measurement_time(Duration::from_secs(5));

    for (size, name) in [(64 * 1024, "64KiB"), (1024 * 1024, "1MiB"), (8 * 1024 * 1024, "8MiB")] {
        if size > 1024 * 1024 {
            group.sample_size(10);
        }
        let document = generate_document(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("to_wire", name), &document, |b, doc| {
            let envelope = encode(doc.clone(), PayloadKind::Document, Some("chart.pdf".into()), None);
            b.iter(|| black_box(to_wire(&envelope).unwrap()));
        });

        let wire = to_wire(&encode(document, PayloadKind::Document, Some("chart.pdf".into()), None)).unwrap();
        group.bench_with_input(BenchmarkId::new("decode", name), &wire, |b, wire| {
            b.iter(|| black_box(decode(wire).unwrap()));
        });
    }

    group.finish();
}

fn bench_photo_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("Photo capture");
    group.sample_size(20);

    let provider = Arc::new(SyntheticCameraProvider::new());
    let mut capture = MediaCaptureController::new(provider, 92);
    capture
        .acquire(&CaptureConstraints {
            width: 1280,
            height: 720,
            ..Default::default()
        })
        .unwrap();

    group.bench_function("jpeg_720p", |b| {
        b.iter(|| black_box(capture.capture_frame().unwrap()));
    });
    group.finish();
}

fn bench_qr_render(c: &mut Criterion) {
    let qr = PairingQr::default();
    let url = "https://chart.example/?photo=1&peer=0123456789abcdef0123456789abcdef";

    c.bench_function("qr_png", |b| {
        b.iter(|| black_box(qr.render_str(url).unwrap().to_png().unwrap()));
    });
}

criterion_group!(benches, bench_envelope_roundtrip, bench_photo_capture, bench_qr_render);
criterion_main!(benches);
