//! Benchmarks for the systematic Reed-Solomon encode/decode hot path
//! (`SPEC_FULL.md` §4.1): per-symbol incremental parity accumulation on the
//! sender side, and erasure-decode on the receiver side.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use norm_engine::gf::{FecScheme, RsCodec};

fn bench_encode_symbol(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_encode_symbol");
    for &(ndata, nparity, seg_size) in &[(16usize, 4usize, 1024usize), (64, 8, 1024), (64, 16, 1400)] {
        let codec = RsCodec::new(FecScheme::Rs8, ndata, nparity).unwrap();
        let data = vec![0xABu8; seg_size];
        group.bench_with_input(
            BenchmarkId::new("rs8", format!("{ndata}+{nparity}x{seg_size}")),
            &(ndata, nparity),
            |b, _| {
                let mut parity: Vec<Vec<u8>> = vec![Vec::new(); nparity];
                b.iter(|| {
                    for p in parity.iter_mut() {
                        p.clear();
                    }
                    for i in 0..ndata {
                        codec.encode_symbol(i, black_box(&data), &mut parity).unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_decode");
    for &(ndata, nparity, seg_size, erasures) in &[(16usize, 4usize, 1024usize, 4usize), (64, 8, 1024, 8)] {
        let codec = RsCodec::new(FecScheme::Rs8, ndata, nparity).unwrap();
        let source: Vec<Vec<u8>> = (0..ndata).map(|i| vec![i as u8; seg_size]).collect();
        let mut parity: Vec<Vec<u8>> = vec![Vec::new(); nparity];
        for (i, s) in source.iter().enumerate() {
            codec.encode_symbol(i, s, &mut parity).unwrap();
        }
        let base: Vec<Option<Vec<u8>>> = source
            .iter()
            .cloned()
            .map(Some)
            .chain(parity.iter().cloned().map(Some))
            .collect();
        let erasure_locs: Vec<usize> = (0..erasures).collect();

        group.bench_with_input(
            BenchmarkId::new("rs8", format!("{ndata}+{nparity}x{seg_size}/erase{erasures}")),
            &erasure_locs,
            |b, locs| {
                b.iter(|| {
                    let mut received = base.clone();
                    for &e in locs {
                        received[e] = None;
                    }
                    codec.decode(black_box(&mut received), locs).unwrap();
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_encode_symbol, bench_decode);
criterion_main!(benches);
