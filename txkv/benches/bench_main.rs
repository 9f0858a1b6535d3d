use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use txkv::storage::data::Additive;
use txkv::storage::memory::Memory;
use txkv::tictoc::{Config, TicToc};

fn bench_insert_commit(c: &mut Criterion) {
    let db = TicToc::new(Memory::new(), Config::default()).unwrap();
    let mut i: u64 = 0;

    c.bench_function("txn insert commit", |b| {
        b.iter(|| {
            let mut txn = db.begin().unwrap();
            txn.insert(black_box(&i.to_be_bytes()), b"value").unwrap();
            txn.commit().unwrap();
            i = i.wrapping_add(1);
        })
    });
}

fn bench_lookup_commit(c: &mut Criterion) {
    let db = TicToc::new(Memory::new(), Config::default()).unwrap();
    let mut txn = db.begin().unwrap();
    txn.insert(b"hot", b"value").unwrap();
    txn.commit().unwrap();

    c.bench_function("txn lookup commit", |b| {
        b.iter(|| {
            let mut txn = db.begin().unwrap();
            black_box(txn.lookup(b"hot").unwrap());
            txn.commit().unwrap();
        })
    });
}

fn bench_update_commit(c: &mut Criterion) {
    let db = TicToc::new(Memory::new(), Config { data: Arc::new(Additive), ..Config::default() })
        .unwrap();
    let one = Additive::encode(1);

    c.bench_function("txn update commit", |b| {
        b.iter(|| {
            let mut txn = db.begin().unwrap();
            txn.update(b"counter", black_box(&one)).unwrap();
            txn.commit().unwrap();
        })
    });
}

criterion_group!(benches, bench_insert_commit, bench_lookup_commit, bench_update_commit);
criterion_main!(benches);
