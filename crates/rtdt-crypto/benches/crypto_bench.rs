//! Performance benchmarks for rtdt-crypto.
//!
//! Run with: `cargo bench -p rtdt-crypto`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rtdt_crypto::aead::AeadKey;
use rtdt_crypto::hash::SessionHasher;
use rtdt_crypto::kem::KemPrivateKey;

// ============================================================================
// AEAD Benchmarks
// ============================================================================

fn bench_seal_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_open");

    // Typical realtime frame sizes up to the maximum datagram
    let sizes = [64, 256, 1200, 4096, 65_000];

    for size in sizes {
        let key = AeadKey::new([0x42u8; 32]);
        let plaintext = vec![0xAA; size];
        let mut sealed = Vec::with_capacity(size + 64);
        let mut opened = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                key.seal_into(black_box(&plaintext), b"", &mut sealed).unwrap();
                key.open_into(black_box(&sealed), b"", &mut opened).unwrap()
            })
        });
    }

    group.finish();
}

// ============================================================================
// Handshake Benchmarks
// ============================================================================

fn bench_kem_decapsulate(c: &mut Criterion) {
    let server = KemPrivateKey::generate();
    let (_, ct) = server.public_key().encapsulate().unwrap();

    c.bench_function("kem_decapsulate", |b| {
        b.iter(|| server.decapsulate(black_box(&ct)).unwrap())
    });
}

fn bench_session_id(c: &mut Criterion) {
    let hasher = SessionHasher::with_key([7u8; 32]);

    c.bench_function("session_id", |b| {
        b.iter(|| hasher.session_id(black_box(&[1u8; 32]), black_box(&[2u8; 32]), 8))
    });
}

criterion_group!(benches, bench_seal_open, bench_kem_decapsulate, bench_session_id);
criterion_main!(benches);
