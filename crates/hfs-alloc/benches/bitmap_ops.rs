//! Benchmark: run search over a fragmented volume bitmap.
//!
//! Compares first-free scanning, best-fit run search and a full
//! `VolumeBitmap::allocate` on a 65535-block bitmap.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hfs_alloc::{
    VolumeBitmap, bitmap_best_fit, bitmap_count_free, bitmap_find_free, bitmap_free_runs,
};
use hfs_types::Extent;

const BLOCKS: u32 = 65_535;

/// ~5% free, in clusters of varying size every ~650 blocks.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; (BLOCKS as usize).div_ceil(8)];
    let mut pos = 100_u32;
    let mut width = 8_u32;
    while pos + width < BLOCKS {
        for i in pos..pos + width {
            bm[(i / 8) as usize] &= !(0x80 >> (i % 8));
        }
        pos += 650;
        width = 8 + (width * 7) % 40;
    }
    bm
}

fn bench_scan(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("scan");
    group.bench_function("count_free", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), BLOCKS)));
    });
    group.bench_function("find_free", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), BLOCKS, black_box(30_000))));
    });
    group.bench_function("free_runs", |b| {
        b.iter(|| black_box(bitmap_free_runs(black_box(&bm), BLOCKS).len()));
    });
    group.finish();
}

fn bench_best_fit(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("best_fit");
    for want in [4_u32, 24, 64] {
        group.bench_function(format!("want_{want}"), |b| {
            b.iter(|| black_box(bitmap_best_fit(black_box(&bm), BLOCKS, want)));
        });
    }
    group.finish();
}

fn bench_allocate(c: &mut Criterion) {
    let base = VolumeBitmap::from_bytes(make_bitmap(), BLOCKS).expect("bitmap");
    c.bench_function("allocate_extend_then_best_fit", |b| {
        b.iter(|| {
            let mut vb = base.clone();
            black_box(vb.allocate(32, Some(Extent::new(90, 10))).expect("alloc"))
        });
    });
}

criterion_group!(benches, bench_scan, bench_best_fit, bench_allocate);
criterion_main!(benches);
