//! The node store interface (component C1) and an in-memory reference
//! implementation.
//!
//! Grounded in `pile.rs`'s shape: a lock-protected `HashMap` keyed by a
//! store-assigned identifier, one inner lock per stored item, plain
//! `std::sync::{Mutex, RwLock}` rather than an async or `parking_lot`
//! alternative. Where `pile.rs` keys blobs by content hash and clones out
//! owned `Bytes` on every read, pages here are kept live behind a real
//! `RwLock` so the tree's hand-over-hand descent can hold a page locked
//! across several operations; the guard types below are the RAII
//! embodiment of the resource-tracking discipline in [`crate::tracker`].
//!
//! Per-page reference counting (component C2) is folded into this same
//! module rather than split out: the original's free-space map and page
//! store are two collaborators behind the same `fs_*`/page interface, and
//! a `HashMap<addr, refcount>` next to the page table is the natural Rust
//! expression of "the same store that owns an address also owns its
//! count".

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::node::Node;
use crate::tracker::WorkUnit;

/// Sentinel address meaning "no page" (an empty tree has no root).
pub const NIL_ADDR: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
}

type PageArc<const KEY_LEN: usize, V> = Arc<RwLock<Node<KEY_LEN, V>>>;

/// A read-locked, pinned page. Dropping it releases both the lock and the
/// pin, and decrements the owning [`WorkUnit`]'s outstanding count.
pub struct NodeReadGuard<'w, const KEY_LEN: usize, V> {
    guard: RwLockReadGuard<'static, Node<KEY_LEN, V>>,
    _page: PageArc<KEY_LEN, V>,
    work_unit: &'w WorkUnit,
}

impl<'w, const KEY_LEN: usize, V> NodeReadGuard<'w, KEY_LEN, V> {
    fn new(page: PageArc<KEY_LEN, V>, work_unit: &'w WorkUnit) -> Result<Self, StoreError> {
        work_unit.acquire();
        let locked = match page.read() {
            Ok(g) => g,
            Err(_) => {
                work_unit.release();
                return Err(StoreError::Poisoned);
            }
        };
        // SAFETY: `_page` keeps the `RwLock` this guard borrows from alive
        // for at least as long as `guard`; both fields are dropped together
        // below, `guard` first, so the borrow never outlives its target.
        let guard: RwLockReadGuard<'static, Node<KEY_LEN, V>> =
            unsafe { std::mem::transmute(locked) };
        Ok(Self {
            guard,
            _page: page,
            work_unit,
        })
    }
}

impl<const KEY_LEN: usize, V> Deref for NodeReadGuard<'_, KEY_LEN, V> {
    type Target = Node<KEY_LEN, V>;
    fn deref(&self) -> &Node<KEY_LEN, V> {
        &self.guard
    }
}

impl<const KEY_LEN: usize, V> Drop for NodeReadGuard<'_, KEY_LEN, V> {
    fn drop(&mut self) {
        self.work_unit.release();
    }
}

/// A write-locked, pinned page. See [`NodeReadGuard`].
pub struct NodeWriteGuard<'w, const KEY_LEN: usize, V> {
    guard: RwLockWriteGuard<'static, Node<KEY_LEN, V>>,
    page: PageArc<KEY_LEN, V>,
    work_unit: &'w WorkUnit,
}

impl<'w, const KEY_LEN: usize, V> NodeWriteGuard<'w, KEY_LEN, V> {
    fn new(page: PageArc<KEY_LEN, V>, work_unit: &'w WorkUnit) -> Result<Self, StoreError> {
        work_unit.acquire();
        let locked = match page.write() {
            Ok(g) => g,
            Err(_) => {
                work_unit.release();
                return Err(StoreError::Poisoned);
            }
        };
        // SAFETY: see NodeReadGuard::new.
        let guard: RwLockWriteGuard<'static, Node<KEY_LEN, V>> =
            unsafe { std::mem::transmute(locked) };
        Ok(Self {
            guard,
            page,
            work_unit,
        })
    }
}

impl<const KEY_LEN: usize, V> Deref for NodeWriteGuard<'_, KEY_LEN, V> {
    type Target = Node<KEY_LEN, V>;
    fn deref(&self) -> &Node<KEY_LEN, V> {
        &self.guard
    }
}

impl<const KEY_LEN: usize, V> DerefMut for NodeWriteGuard<'_, KEY_LEN, V> {
    fn deref_mut(&mut self) -> &mut Node<KEY_LEN, V> {
        &mut self.guard
    }
}

impl<const KEY_LEN: usize, V> Drop for NodeWriteGuard<'_, KEY_LEN, V> {
    fn drop(&mut self) {
        self.work_unit.release();
    }
}

/// The narrow interface the tree algorithm drives: allocate, fetch (shared
/// or exclusive), release (via `Drop`), fork-on-write, and the refcount
/// queries that decide whether a fork is needed.
///
/// `mark_dirty` is called on a freshly write-locked, not-yet-mutated page,
/// before the tree algorithm edits it — the same moment a persistent trie
/// forks a shared branch before its caller writes into it.
/// A page with refcount 1 is returned
/// untouched; a page shared with a clone is copied to a fresh address
/// (its own refcount decremented by one, the copy's set to one) and the
/// *new* guard is returned. Callers must use the returned guard's address
/// to update any parent pointer — or, for a root page, the tree's own
/// stored root address, since nothing else points at a root from above.
/// An ordinary split never relocates a page; only a fork of a page shared
/// with a clone does.
pub trait NodeStore<const KEY_LEN: usize, V: Clone> {
    type ReadGuard<'w>: Deref<Target = Node<KEY_LEN, V>>
    where
        Self: 'w;
    type WriteGuard<'w>: Deref<Target = Node<KEY_LEN, V>> + DerefMut
    where
        Self: 'w;

    fn alloc<'w>(
        &self,
        kind: NodeKind,
        is_root: bool,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::WriteGuard<'w>, StoreError>;

    fn dealloc(&self, addr: u64) -> Result<(), StoreError>;

    fn get_sl<'w>(
        &self,
        addr: u64,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::ReadGuard<'w>, StoreError>;

    fn get_xl<'w>(
        &self,
        addr: u64,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::WriteGuard<'w>, StoreError>;

    fn mark_dirty<'w>(
        &self,
        node: Self::WriteGuard<'w>,
    ) -> Result<Self::WriteGuard<'w>, StoreError>;

    fn fs_inc_refcount(&self, addr: u64) -> Result<(), StoreError>;

    fn fs_get_refcount(&self, addr: u64) -> Result<u32, StoreError>;
}

/// An in-memory page arena keyed by a monotonically increasing address.
/// Ships as the reference `NodeStore`, used throughout this crate's own
/// tests; a production backing (an mmap'd pile, an object-store-backed
/// page cache) would implement the same trait.
pub struct MemStore<const KEY_LEN: usize, V> {
    pages: RwLock<HashMap<u64, PageArc<KEY_LEN, V>>>,
    refcounts: RwLock<HashMap<u64, u32>>,
    next_addr: AtomicU64,
    chaos_yields: bool,
}

impl<const KEY_LEN: usize, V> MemStore<KEY_LEN, V> {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::new()),
            refcounts: RwLock::new(HashMap::new()),
            next_addr: AtomicU64::new(NIL_ADDR + 1),
            chaos_yields: false,
        }
    }

    /// A store that yields the current thread inside `alloc`/`dealloc`/
    /// `get_sl`/`get_xl`, the same points the original yielded at under its
    /// cooperative scheduler to shake out concurrency bugs. Intended for
    /// multi-threaded tests pitting several clones against each other on
    /// real OS threads, not for production use.
    pub fn with_chaos_yields() -> Self {
        Self {
            chaos_yields: true,
            ..Self::new()
        }
    }

    fn maybe_yield(&self) {
        if self.chaos_yields {
            std::thread::yield_now();
        }
    }

    /// Number of live (non-freed) pages. Used by leak-detection tests.
    pub fn live_page_count(&self) -> usize {
        self.pages.read().unwrap().len()
    }

    pub fn live_addresses(&self) -> Vec<u64> {
        self.pages.read().unwrap().keys().copied().collect()
    }
}

impl<const KEY_LEN: usize, V> Default for MemStore<KEY_LEN, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const KEY_LEN: usize, V: Clone> NodeStore<KEY_LEN, V> for MemStore<KEY_LEN, V> {
    type ReadGuard<'w>
        = NodeReadGuard<'w, KEY_LEN, V>
    where
        Self: 'w;
    type WriteGuard<'w>
        = NodeWriteGuard<'w, KEY_LEN, V>
    where
        Self: 'w;

    fn alloc<'w>(
        &self,
        kind: NodeKind,
        is_root: bool,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::WriteGuard<'w>, StoreError> {
        self.maybe_yield();
        let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let node = match kind {
            NodeKind::Leaf => Node::new_leaf(addr, is_root),
            NodeKind::Index => Node::new_index(addr, is_root),
        };
        let page: PageArc<KEY_LEN, V> = Arc::new(RwLock::new(node));
        self.refcounts.write()?.insert(addr, 1);
        self.pages.write()?.insert(addr, page.clone());
        NodeWriteGuard::new(page, work_unit)
    }

    fn dealloc(&self, addr: u64) -> Result<(), StoreError> {
        self.maybe_yield();
        let mut refcounts = self.refcounts.write()?;
        let count = refcounts
            .get_mut(&addr)
            .ok_or(StoreError::UnknownAddress(addr))?;
        *count -= 1;
        if *count == 0 {
            refcounts.remove(&addr);
            self.pages.write()?.remove(&addr);
        }
        Ok(())
    }

    fn get_sl<'w>(
        &self,
        addr: u64,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::ReadGuard<'w>, StoreError> {
        self.maybe_yield();
        let page = self
            .pages
            .read()?
            .get(&addr)
            .cloned()
            .ok_or(StoreError::UnknownAddress(addr))?;
        NodeReadGuard::new(page, work_unit)
    }

    fn get_xl<'w>(
        &self,
        addr: u64,
        work_unit: &'w WorkUnit,
    ) -> Result<Self::WriteGuard<'w>, StoreError> {
        self.maybe_yield();
        let page = self
            .pages
            .read()?
            .get(&addr)
            .cloned()
            .ok_or(StoreError::UnknownAddress(addr))?;
        NodeWriteGuard::new(page, work_unit)
    }

    fn mark_dirty<'w>(
        &self,
        node: Self::WriteGuard<'w>,
    ) -> Result<Self::WriteGuard<'w>, StoreError> {
        let addr = node.addr;
        let refcount = self.fs_get_refcount(addr)?;
        if refcount <= 1 {
            return Ok(node);
        }

        let new_addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let mut copy: Node<KEY_LEN, V> = (*node).clone();
        copy.addr = new_addr;

        {
            let mut refcounts = self.refcounts.write()?;
            *refcounts
                .get_mut(&addr)
                .expect("refcount present for a locked, live page") -= 1;
            refcounts.insert(new_addr, 1);
        }

        let page: PageArc<KEY_LEN, V> = Arc::new(RwLock::new(copy));
        self.pages.write()?.insert(new_addr, page.clone());

        let work_unit = node.work_unit;
        drop(node);
        NodeWriteGuard::new(page, work_unit)
    }

    fn fs_inc_refcount(&self, addr: u64) -> Result<(), StoreError> {
        let mut refcounts = self.refcounts.write()?;
        let count = refcounts
            .get_mut(&addr)
            .ok_or(StoreError::UnknownAddress(addr))?;
        *count = count.checked_add(1).expect("refcount overflow");
        Ok(())
    }

    fn fs_get_refcount(&self, addr: u64) -> Result<u32, StoreError> {
        let refcounts = self.refcounts.read()?;
        refcounts
            .get(&addr)
            .copied()
            .ok_or(StoreError::UnknownAddress(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_get_dealloc_roundtrip() {
        let store: MemStore<4, u32> = MemStore::new();
        let wu = WorkUnit::new();
        let addr = {
            let mut guard = store.alloc(NodeKind::Leaf, false, &wu).unwrap();
            guard.insert_leaf::<crate::config::LexicographicOrder>([0, 0, 0, 1], 7);
            guard.addr
        };
        assert_eq!(store.fs_get_refcount(addr).unwrap(), 1);
        {
            let guard = store.get_sl(addr, &wu).unwrap();
            assert_eq!(guard.leaf_entries()[0].1, 7);
        }
        store.dealloc(addr).unwrap();
        assert!(store.fs_get_refcount(addr).is_err());
        assert_eq!(store.live_page_count(), 0);
    }

    #[test]
    fn mark_dirty_forks_shared_pages() {
        let store: MemStore<4, u32> = MemStore::new();
        let wu = WorkUnit::new();
        let addr = {
            let guard = store.alloc(NodeKind::Leaf, false, &wu).unwrap();
            guard.addr
        };
        store.fs_inc_refcount(addr).unwrap();
        assert_eq!(store.fs_get_refcount(addr).unwrap(), 2);

        let guard = store.get_xl(addr, &wu).unwrap();
        let forked = store.mark_dirty(guard).unwrap();
        assert_ne!(forked.addr, addr);
        assert_eq!(store.fs_get_refcount(addr).unwrap(), 1);
        assert_eq!(store.fs_get_refcount(forked.addr).unwrap(), 1);
    }

    #[test]
    fn chaos_yields_does_not_change_observable_behavior() {
        let store: MemStore<4, u32> = MemStore::with_chaos_yields();
        let wu = WorkUnit::new();
        let addr = {
            let mut guard = store.alloc(NodeKind::Leaf, false, &wu).unwrap();
            guard.insert_leaf::<crate::config::LexicographicOrder>([0, 0, 0, 1], 7);
            guard.addr
        };
        let guard = store.get_sl(addr, &wu).unwrap();
        assert_eq!(guard.leaf_entries()[0].1, 7);
        drop(guard);
        store.dealloc(addr).unwrap();
        assert_eq!(store.live_page_count(), 0);
    }

    #[test]
    fn mark_dirty_is_noop_when_exclusively_owned() {
        let store: MemStore<4, u32> = MemStore::new();
        let wu = WorkUnit::new();
        let addr = {
            let guard = store.alloc(NodeKind::Leaf, false, &wu).unwrap();
            guard.addr
        };
        let guard = store.get_xl(addr, &wu).unwrap();
        let same = store.mark_dirty(guard).unwrap();
        assert_eq!(same.addr, addr);
    }
}
