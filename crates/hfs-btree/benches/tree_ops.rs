//! Benchmark: insert, point lookup and full scan over an in-memory tree.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hfs_btree::{BTree, KeyOrder, MemNodeStore};
use std::cmp::Ordering;

struct U32Order;

impl KeyOrder for U32Order {
    const MAX_KEY_LEN: u8 = 7;
    const NAME: &'static str = "bench";

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a[..4].cmp(&b[..4])
    }
}

fn key(n: u32) -> [u8; 7] {
    let mut k = [0_u8; 7];
    k[..4].copy_from_slice(&n.to_be_bytes());
    k
}

/// Multiplicative scramble so inserts land all over the key space.
fn scrambled(i: u32) -> u32 {
    i.wrapping_mul(2_654_435_761)
}

fn populated(count: u32) -> (MemNodeStore, BTree<U32Order>) {
    let mut store = MemNodeStore::new(8, 1 << 16);
    let mut tree = BTree::<U32Order>::create(&mut store).expect("create");
    for i in 0..count {
        tree.insert(&mut store, &key(scrambled(i)), &[0_u8; 60])
            .expect("insert");
    }
    (store, tree)
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_2000_scrambled", |b| {
        b.iter(|| black_box(populated(2000)));
    });
}

fn bench_search(c: &mut Criterion) {
    let (mut store, tree) = populated(2000);
    c.bench_function("search_hit", |b| {
        let mut i = 0_u32;
        b.iter(|| {
            i = (i + 1) % 2000;
            black_box(tree.search(&mut store, &key(scrambled(i))).expect("search"))
        });
    });
}

fn bench_walk(c: &mut Criterion) {
    let (mut store, tree) = populated(2000);
    c.bench_function("walk_all_leaves", |b| {
        b.iter(|| black_box(tree.entries(&mut store).expect("walk").len()));
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_walk);
criterion_main!(benches);
