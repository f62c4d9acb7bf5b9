//! Compile-time capability traits and runtime fanout parameters.
//!
//! Key comparison, value lifecycle, and the node-store surface are all
//! supplied as traits rather than runtime callbacks or a config file, the
//! same shape a persistent trie's `KeyOrdering`/`KeySegmentation` pair
//! takes.

use std::cmp::Ordering;

/// Implementation-defined cap on the number of entries a single
/// `insert_range`/`remove_range` call will batch before returning
/// [`crate::error::TreeError::BatchTooLarge`].
pub const MAX_RANGE_BATCH: usize = 4096;

/// Total order and successor operation over fixed-width keys.
///
/// `inc` returns the immediate successor of a key under the order `cmp`
/// defines, or `None` if `key` is already the maximum representable key.
/// Range scans use it to turn an exclusive bound into an inclusive one.
pub trait KeyOrder<const KEY_LEN: usize> {
    fn cmp(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> Ordering;
    fn inc(key: &[u8; KEY_LEN]) -> Option<[u8; KEY_LEN]>;
}

/// Byte-lexicographic order over the key, the conventional sign convention
/// (`a < b` iff `a` sorts before `b` byte-for-byte).
pub struct LexicographicOrder;

impl<const KEY_LEN: usize> KeyOrder<KEY_LEN> for LexicographicOrder {
    fn cmp(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> Ordering {
        a.cmp(b)
    }

    fn inc(key: &[u8; KEY_LEN]) -> Option<[u8; KEY_LEN]> {
        let mut next = *key;
        for byte in next.iter_mut().rev() {
            if *byte == u8::MAX {
                *byte = 0;
                continue;
            }
            *byte += 1;
            return Some(next);
        }
        None
    }
}

/// Lifecycle hook for values stored in leaves.
///
/// Values carry no structure the tree understands; `release` is called
/// exactly once when a value is logically dropped from the tree (removed,
/// or overwritten by a new value for the same key), so a value may own a
/// resource outside the tree (e.g. an extent on a backing store).
pub trait ValueCodec {
    type Value: Clone;

    fn release(_value: &Self::Value) {}

    fn format(value: &Self::Value) -> String
    where
        Self::Value: std::fmt::Debug,
    {
        format!("{value:?}")
    }
}

/// A [`ValueCodec`] for values with no external resources to release.
pub struct PlainValue<V>(std::marker::PhantomData<V>);

impl<V: Clone> ValueCodec for PlainValue<V> {
    type Value = V;
}

/// Fanout bounds for a tree, fixed for the tree's lifetime.
///
/// `2 <= min_fanout <= ceil(non_root_fanout / 2)` and
/// `root_fanout <= non_root_fanout` must hold; [`FanoutConfig::new`]
/// enforces both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    pub root_fanout: usize,
    pub non_root_fanout: usize,
    pub min_fanout: usize,
}

impl FanoutConfig {
    pub fn new(root_fanout: usize, non_root_fanout: usize, min_fanout: usize) -> Self {
        assert!(min_fanout >= 2, "min_fanout must be at least 2");
        assert!(
            min_fanout <= non_root_fanout.div_ceil(2),
            "min_fanout must be at most ceil(non_root_fanout / 2)"
        );
        assert!(
            root_fanout <= non_root_fanout,
            "root_fanout must not exceed non_root_fanout"
        );
        Self {
            root_fanout,
            non_root_fanout,
            min_fanout,
        }
    }
}

impl Default for FanoutConfig {
    /// A modest default suitable for tests and small trees: matches the
    /// `F_root = F = 5, m = 2` parameters used by the scenario tests.
    fn default() -> Self {
        Self::new(5, 5, 2)
    }
}
