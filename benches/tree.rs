use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{thread_rng, Rng};

use snaptree::{FanoutConfig, LexicographicOrder, MemStore, PlainValue, Tree};

const KEY_LEN: usize = 8;
type BenchTree = Tree<KEY_LEN, MemStore<KEY_LEN, u64>, LexicographicOrder, PlainValue<u64>>;

fn random_keys(n: usize) -> Vec<[u8; KEY_LEN]> {
    let mut rng = thread_rng();
    (0..n).map(|_| rng.gen::<u64>().to_be_bytes()).collect()
}

fn sorted_keys(n: usize) -> Vec<[u8; KEY_LEN]> {
    (0..n as u64).map(u64::to_be_bytes).collect()
}

fn new_tree() -> BenchTree {
    Tree::init(Arc::new(MemStore::new()), FanoutConfig::new(64, 64, 16), 1)
}

fn populated(n: usize) -> BenchTree {
    let mut t = new_tree();
    for key in sorted_keys(n) {
        t.insert(key, 0).unwrap();
    }
    t
}

fn criterion_benchmark(c: &mut Criterion) {
    for &n in &[1_000usize, 10_000, 100_000] {
        let keys = random_keys(n);
        c.bench_function(&format!("insert {n} random keys"), |b| {
            b.iter(|| {
                let mut t = new_tree();
                for key in black_box(&keys) {
                    t.insert(*key, 0).unwrap();
                }
            })
        });
    }

    for &n in &[1_000usize, 10_000, 100_000] {
        let t = populated(n);
        let keys = sorted_keys(n);
        c.bench_function(&format!("lookup in tree of {n}"), |b| {
            b.iter(|| {
                for key in black_box(&keys) {
                    black_box(t.lookup(key).unwrap());
                }
            })
        });
    }

    for &n in &[1_000usize, 10_000, 100_000] {
        let t = populated(n);
        c.bench_function(&format!("lookup_range over tree of {n}"), |b| {
            b.iter(|| {
                let (_, _, count) = t
                    .lookup_range(&[0; KEY_LEN], &(n as u64 / 2).to_be_bytes(), usize::MAX)
                    .unwrap();
                black_box(count);
            })
        });
    }

    for &n in &[1_000usize, 10_000, 100_000] {
        let t = populated(n);
        c.bench_function(&format!("clone_tree of {n}"), |b| {
            let mut tid = 2u64;
            b.iter(|| {
                tid += 1;
                black_box(t.clone_tree(tid).unwrap());
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
