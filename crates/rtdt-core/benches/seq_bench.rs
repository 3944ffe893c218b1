//! Performance benchmarks for rtdt-core.
//!
//! Run with: `cargo bench -p rtdt-core`

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use rtdt_core::frame::{FramedPacket, FramedPktBuf};
use rtdt_core::ids::PeerId;
use rtdt_core::seq::{SeqTracker, SeqWindow};

fn bench_seq_tracker(c: &mut Criterion) {
    let start = 1u32 << 16;
    let tracker = SeqTracker::with_window(SeqWindow::new(start, 1));
    let mut rng = rand::thread_rng();

    // Mostly in-order with jitter inside the window
    let seqs: Vec<u32> = (0..4096u32)
        .map(|i| start + i + rng.gen_range(0..16))
        .collect();

    let mut group = c.benchmark_group("seq_tracker");
    group.throughput(Throughput::Elements(seqs.len() as u64));
    group.bench_function("may_accept_jittered", |b| {
        b.iter(|| {
            for &s in &seqs {
                black_box(tracker.may_accept(s));
            }
        })
    });
    group.finish();
}

fn bench_header_rewrite(c: &mut Criterion) {
    let pkt = FramedPacket {
        target: PeerId(1),
        source: PeerId(1),
        sequence: 1,
        data: vec![0xAA; 1200],
    };
    let mut buf = FramedPktBuf::new();
    buf.set_full_data(&pkt.encode()).unwrap();

    c.bench_function("header_rewrite", |b| {
        let mut seq = 0u32;
        b.iter(|| {
            seq = seq.wrapping_add(1);
            buf.set_target(black_box(PeerId(seq)));
            buf.set_sequence(seq);
            black_box(buf.as_bytes().len())
        })
    });
}

criterion_group!(benches, bench_seq_tracker, bench_header_rewrite);
criterion_main!(benches);
