use std::sync::Arc;
use std::thread;

use snaptree::{FanoutConfig, LexicographicOrder, MemStore, PlainValue, Tree};

const KEY_LEN: usize = 4;
type ConcTree = Tree<KEY_LEN, MemStore<KEY_LEN, u32>, LexicographicOrder, PlainValue<u32>>;

fn k(n: u32) -> [u8; KEY_LEN] {
    n.to_be_bytes()
}

/// Several clones of one tree, each mutated on its own OS thread against a
/// chaos-yielding store, matching the original's cooperative-scheduler
/// interleaving stress test. Each thread owns its clone exclusively
/// (single-writer-per-tree), so the only cross-thread interaction is
/// through the shared store and its refcount table.
#[test]
fn divergent_clones_mutate_concurrently_without_corruption() {
    let store = Arc::new(MemStore::with_chaos_yields());
    let cfg = FanoutConfig::new(5, 5, 2);

    let mut base: ConcTree = Tree::init(Arc::clone(&store), cfg, 1);
    for i in 0..100 {
        base.insert(k(i), i).unwrap();
    }

    let handles: Vec<_> = (2..6)
        .map(|tid| {
            let mut clone = base.clone_tree(tid).unwrap();
            thread::spawn(move || {
                for i in 0..100 {
                    if (i + tid as u32) % 2 == 0 {
                        clone.remove(&k(i)).unwrap();
                    } else {
                        clone.insert(k(i), i * 1000 + tid as u32).unwrap();
                    }
                }
                assert!(clone.validate().unwrap());
                clone
            })
        })
        .collect();

    let clones: Vec<ConcTree> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(base.validate().unwrap());
    for i in 0..100 {
        assert_eq!(base.lookup(&k(i)).unwrap(), Some(i));
    }

    for (tid, clone) in (2u64..6).zip(clones.iter()) {
        for i in 0..100 {
            let expected = if (i + tid as u32) % 2 == 0 {
                None
            } else {
                Some(i * 1000 + tid as u32)
            };
            assert_eq!(clone.lookup(&k(i)).unwrap(), expected);
        }
    }

    let refs: Vec<&ConcTree> = std::iter::once(&base).chain(clones.iter()).collect();
    assert!(ConcTree::validate_clones(&refs).unwrap());
}
