//! The tree algorithm (component C4): root-to-leaf descents, preemptive
//! splits and merges, single-key and range operations, and the COW
//! propagation that ties mutations back to [`crate::store::NodeStore`]'s
//! refcount-driven `mark_dirty`.
//!
//! # Root addressing and COW (a resolved open question)
//!
//! §4.3 of the distilled spec says a root split "rewrites the root in
//! place" so the root's address never changes, since nothing outside the
//! tree's own handle depends on it. That is true for a root with no
//! clones. It stops being true the moment `clone()` hands a second `Tree`
//! handle the *same* root address (§4.4): if tree A then mutates that
//! page's bytes in place, tree B — which has no separate pointer to
//! retarget, only the identical address — observes A's write directly,
//! which breaks clone isolation (invariant 5, §8 property 6).
//!
//! This implementation resolves the question by generalizing "update
//! whoever points at this node" to include the `Tree::root` field itself:
//! a root is forked exactly like any other page when it is shared and
//! about to be mutated ([`Tree::fork_if_shared`]), and the fork's new
//! address becomes the tree's own `root`, the same way a parent's child
//! pointer is updated when a non-root child forks. Root *splits*
//! (capacity overflow) still rewrite contents into the same guard without
//! introducing a second address, preserving the "only one address moves
//! per mutation, and only when sharing forces it" spirit of the original
//! design; what's given up is the letter of "the root's address never
//! changes across the tree's whole lifetime" in exchange for correct
//! clone isolation.
//!
//! # Locking granularity (a documented simplification)
//!
//! §5 describes hand-over-hand release once a structural change can no
//! longer propagate upward. This implementation takes the simpler,
//! strictly more conservative route: the full root-to-leaf path stays
//! write-locked for the duration of a structural operation (insert,
//! remove), releasing only when the recursive call returns. Read paths
//! ([`Tree::lookup`], [`Tree::lookup_range`]) do release the parent as
//! soon as a child is locked, since no write ever needs to backtrack.
//! Holding the full write path is safe and matches the single-writer-
//! per-tree Non-goal (§1); it simply forgoes the original's optimization
//! of releasing an ancestor early when it can be proven not to change.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{FanoutConfig, KeyOrder, ValueCodec, MAX_RANGE_BATCH};
use crate::error::TreeError;
use crate::node::Key;
use crate::store::{NodeKind, NodeStore, NIL_ADDR};
use crate::tracker::WorkUnit;

/// A single copy-on-write B+tree, backed by a shared [`NodeStore`].
///
/// `KEY_LEN` is the key's fixed byte width; `St` is the backing store; `O`
/// supplies key order and successor; `VC` supplies the value's lifecycle
/// hook. A `Tree` is cheap to hold (one `Arc` clone and a handful of
/// `u64`s/`usize`s) and cheap to [`Tree::clone_tree`] — the whole point of
/// the design.
pub struct Tree<const KEY_LEN: usize, St, O, VC>
where
    St: NodeStore<KEY_LEN, VC::Value>,
    O: KeyOrder<KEY_LEN>,
    VC: ValueCodec,
{
    store: Arc<St>,
    cfg: FanoutConfig,
    tid: u64,
    root: u64,
    _marker: PhantomData<(O, VC)>,
}

impl<const KEY_LEN: usize, St, O, VC> Tree<KEY_LEN, St, O, VC>
where
    St: NodeStore<KEY_LEN, VC::Value>,
    O: KeyOrder<KEY_LEN>,
    VC: ValueCodec,
{
    /// `Tree::init`: the uninit -> empty transition of §4.3's state table.
    /// No root is allocated yet; call [`Tree::create`] (or simply
    /// [`Tree::insert`], which creates lazily) to get a singleton tree.
    pub fn init(store: Arc<St>, cfg: FanoutConfig, tid: u64) -> Self {
        Self {
            store,
            cfg,
            tid,
            root: NIL_ADDR,
            _marker: PhantomData,
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn is_empty_state(&self) -> bool {
        self.root == NIL_ADDR
    }

    /// The empty -> singleton transition: allocates a fresh, empty root
    /// leaf. A no-op if the tree already has a root (idempotent, so
    /// [`Tree::insert`] can call it unconditionally on first use).
    pub fn create(&mut self) -> Result<(), TreeError> {
        if self.root != NIL_ADDR {
            return Ok(());
        }
        let wu = WorkUnit::new();
        let root = self.store.alloc(NodeKind::Leaf, true, &wu)?;
        self.root = root.addr;
        drop(root);
        wu.finish();
        Ok(())
    }

    /// Walks every page reachable from this tree's root and `dealloc`s it,
    /// decrementing refcounts (and only physically freeing a page that no
    /// other clone still references). Returns the tree to the empty
    /// state.
    pub fn delete(&mut self) -> Result<(), TreeError> {
        if self.root == NIL_ADDR {
            return Ok(());
        }
        let wu = WorkUnit::new();
        self.dealloc_subtree(self.root, &wu)?;
        self.root = NIL_ADDR;
        wu.finish();
        Ok(())
    }

    /// Tears down this handle. Distinct from [`Tree::delete`]: `delete`
    /// frees the tree's *content*; `destroy` retires the handle itself
    /// (the uninit state of §4.3's table). Trivial here since `Tree` has
    /// no other resources, but kept as a named operation so a caller
    /// embedding a [`crate::registry::Registry`] has a single place to
    /// unregister the tid.
    pub fn destroy(self) {}

    fn dealloc_subtree(&self, addr: u64, wu: &WorkUnit) -> Result<(), TreeError> {
        // A page still shared with another clone survives this tree's
        // one-reference decrement, and that clone remains exclusively
        // responsible for its own descendants and their values — neither
        // child recursion nor value release may run for a page this tree
        // isn't the sole referrer of.
        let sole_referrer = self.store.fs_get_refcount(addr)? == 1;
        if sole_referrer {
            let children = {
                let node = self.store.get_sl(addr, wu)?;
                if node.is_leaf() {
                    for (_, v) in node.leaf_entries() {
                        VC::release(v);
                    }
                    Vec::new()
                } else {
                    node.index_entries().iter().map(|(_, a)| *a).collect()
                }
            };
            for child in children {
                self.dealloc_subtree(child, wu)?;
            }
        }
        self.store.dealloc(addr)?;
        Ok(())
    }

    /// `clone()` (§4.4): the new tree starts out sharing every page with
    /// `self`, at the cost of a single `fs_inc_refcount` on the root.
    /// Interior and leaf pages become shared transitively — nothing else
    /// is touched until a write forces a fork somewhere along its path.
    pub fn clone_tree(&self, new_tid: u64) -> Result<Self, TreeError> {
        if self.root != NIL_ADDR {
            self.store.fs_inc_refcount(self.root)?;
        }
        Ok(Self {
            store: Arc::clone(&self.store),
            cfg: self.cfg,
            tid: new_tid,
            root: self.root,
            _marker: PhantomData,
        })
    }

    /// Forks `node` if it is shared, per the `mark_dirty` contract (§4.1):
    /// called immediately before a mutation, never after, since a Rust
    /// `Arc<RwLock<Node>>` makes "mutate in place, then decide whether to
    /// relocate" impossible — any other clone holding the same `Arc`
    /// would observe the mutation through its own guard before the
    /// relocation decision ever ran. Forking first and mutating the
    /// (possibly fresh) private copy is the ownership-respecting
    /// reordering of the same contract.
    ///
    /// `clone_tree` (§4.4) only bumps the root's own refcount — every
    /// page beneath it becomes shared *transitively*, without its own
    /// stored count ever being touched, until something forks it. A node
    /// reached through such a page reads `fs_get_refcount == 1` in
    /// isolation despite being reachable from more than one tree, so
    /// `ancestor_shared` carries that fact down the descent: true once
    /// any ancestor on this path is itself shared (by its own stored
    /// count or by a shared ancestor of its own), even though nothing
    /// about `node` itself says so yet. A transitive share is realized
    /// here by bumping the refcount before handing off to `mark_dirty`,
    /// which is what actually forces the fork.
    ///
    /// `privatized` records addresses this call already knows are
    /// exclusively this tree's for the rest of the current insert/remove
    /// — either because they were just forked, or because they were
    /// found private outright. A node can be consulted more than once
    /// within one structural operation (once to install a split's new
    /// child pointers, again afterward if the recursion below it also
    /// forked); `ancestor_shared` does not get cleared after the first
    /// call, so without this guard a second call would see the same
    /// stale "shared" hint and fork an already-private page a second
    /// time, leaking the first fork's address.
    fn fork_if_shared<'w>(
        &self,
        node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        privatized: &mut HashSet<u64>,
    ) -> Result<St::WriteGuard<'w>, TreeError> {
        if privatized.contains(&node.addr) {
            return Ok(node);
        }
        let stored_shared = self.store.fs_get_refcount(node.addr)? > 1;
        if !ancestor_shared && !stored_shared {
            privatized.insert(node.addr);
            return Ok(node);
        }
        if !stored_shared {
            self.store.fs_inc_refcount(node.addr)?;
        }
        let forked = self.store.mark_dirty(node)?;
        privatized.insert(forked.addr);
        Ok(forked)
    }

    // ---------------------------------------------------------------
    // Single-key operations
    // ---------------------------------------------------------------

    pub fn lookup(&self, key: &Key<KEY_LEN>) -> Result<Option<VC::Value>, TreeError> {
        if self.root == NIL_ADDR {
            return Ok(None);
        }
        let wu = WorkUnit::new();
        let mut node = self.store.get_sl(self.root, &wu)?;
        loop {
            if node.is_leaf() {
                let found = match node.search_leaf::<O>(key) {
                    Ok(pos) => Some(node.leaf_entries()[pos].1.clone()),
                    Err(_) => None,
                };
                drop(node);
                wu.finish();
                return Ok(found);
            }
            let idx = node.child_for::<O>(key);
            let child_addr = node.index_entries()[idx].1;
            let child = self.store.get_sl(child_addr, &wu)?;
            drop(node);
            node = child;
        }
    }

    pub fn insert(&mut self, key: Key<KEY_LEN>, value: VC::Value) -> Result<bool, TreeError> {
        self.create()?;
        let wu = WorkUnit::new();
        let mut privatized = HashSet::new();
        let mut root = self.store.get_xl(self.root, &wu)?;
        let root_shared = self.store.fs_get_refcount(root.addr)? > 1;
        if root.is_full(&self.cfg) {
            root = self.fork_if_shared(root, root_shared, &mut privatized)?;
            root = self.split_root_in_place(root, &wu)?;
        }
        let (replaced, new_root_addr) =
            self.insert_rec(root, root_shared, key, value, &wu, &mut privatized)?;
        self.root = new_root_addr;
        wu.finish();
        Ok(replaced)
    }

    pub fn remove(&mut self, key: &Key<KEY_LEN>) -> Result<bool, TreeError> {
        if self.root == NIL_ADDR {
            return Ok(false);
        }
        let wu = WorkUnit::new();
        let mut privatized = HashSet::new();
        let root = self.store.get_xl(self.root, &wu)?;
        let root_shared = self.store.fs_get_refcount(root.addr)? > 1;
        let (removed, new_root_addr) =
            self.remove_rec(root, root_shared, key, &wu, &mut privatized)?;
        self.root = new_root_addr;
        wu.finish();
        Ok(removed)
    }

    /// Allocates two fresh non-root children holding the lower/upper
    /// halves of `root`'s entries and rewrites `root`'s own body as a
    /// 2-entry index over them. `root` must already be private
    /// (forked if it was shared) before calling this — the whole point is
    /// that the bytes at `root.addr` change, and a shared page's bytes
    /// must never change out from under another clone.
    fn split_root_in_place<'w>(
        &self,
        mut root: St::WriteGuard<'w>,
        wu: &'w WorkUnit,
    ) -> Result<St::WriteGuard<'w>, TreeError> {
        let kind = if root.is_leaf() {
            NodeKind::Leaf
        } else {
            NodeKind::Index
        };
        let (right_body, split_key) = root.split_off();
        let left_body = root.take_body();

        let mut left = self.store.alloc(kind, false, wu)?;
        left.install_body(left_body);
        let left_min = left
            .min_key()
            .expect("the lower half of a root split is never empty");
        let left_addr = left.addr;
        drop(left);

        let mut right = self.store.alloc(kind, false, wu)?;
        right.install_body(right_body);
        let right_addr = right.addr;
        drop(right);

        root.install_body(crate::node::NodeBody::Index(vec![
            (left_min, left_addr),
            (split_key, right_addr),
        ]));
        Ok(root)
    }

    /// Inserts into the subtree rooted at `node` (already write-locked,
    /// and guaranteed not full — the caller pre-splits). Returns whether
    /// an existing key's value was replaced and `node`'s address after
    /// any fork, which the caller compares against its own pointer (the
    /// `root` field, or a parent's child slot) to decide whether that
    /// pointer needs updating.
    fn insert_rec<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        key: Key<KEY_LEN>,
        value: VC::Value,
        wu: &'w WorkUnit,
        privatized: &mut HashSet<u64>,
    ) -> Result<(bool, u64), TreeError> {
        // Whether `node`'s own children are transitively shared: true the
        // moment `node` itself is (whether that's inherited from further
        // up, via `ancestor_shared`, or because `node` is a clone's root).
        // Captured once, before any mutation of `node`, so it stays valid
        // no matter how many times `node` gets forked below.
        let children_shared = ancestor_shared || self.store.fs_get_refcount(node.addr)? > 1;

        if node.is_leaf() {
            node = self.fork_if_shared(node, ancestor_shared, privatized)?;
            let old = node.insert_leaf::<O>(key, value);
            if let Some(old_value) = &old {
                VC::release(old_value);
            }
            return Ok((old.is_some(), node.addr));
        }

        let idx = node.child_for::<O>(&key);
        let child_addr = node.index_entries()[idx].1;
        let child = self.store.get_xl(child_addr, wu)?;

        let (child, idx) = if child.is_full(&self.cfg) {
            let mut child = self.fork_if_shared(child, children_shared, privatized)?;
            let (right_body, split_key) = child.split_off();
            let kind = if child.is_leaf() {
                NodeKind::Leaf
            } else {
                NodeKind::Index
            };
            let mut right = self.store.alloc(kind, false, wu)?;
            right.install_body(right_body);

            node = self.fork_if_shared(node, ancestor_shared, privatized)?;
            node.replace_child_addr(idx, child.addr);
            node.insert_child(idx + 1, split_key, right.addr);

            if O::cmp(&key, &split_key) != Ordering::Less {
                drop(child);
                (right, idx + 1)
            } else {
                drop(right);
                (child, idx)
            }
        } else {
            (child, idx)
        };

        let (replaced, new_child_addr) =
            self.insert_rec(child, children_shared, key, value, wu, privatized)?;

        if new_child_addr != node.index_entries()[idx].1 {
            node = self.fork_if_shared(node, ancestor_shared, privatized)?;
            node.replace_child_addr(idx, new_child_addr);
        }

        Ok((replaced, node.addr))
    }

    /// Removes from the subtree rooted at `node`. Returns whether the key
    /// was present and `node`'s address after any fork/collapse.
    fn remove_rec<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        key: &Key<KEY_LEN>,
        wu: &'w WorkUnit,
        privatized: &mut HashSet<u64>,
    ) -> Result<(bool, u64), TreeError> {
        let children_shared = ancestor_shared || self.store.fs_get_refcount(node.addr)? > 1;

        if node.is_leaf() {
            return match node.search_leaf::<O>(key) {
                Err(_) => Ok((false, node.addr)),
                Ok(_) => {
                    node = self.fork_if_shared(node, ancestor_shared, privatized)?;
                    let pos = node
                        .search_leaf::<O>(key)
                        .expect("key found before fork is still present after forking a copy");
                    let (_, value) = node.remove_leaf_at(pos);
                    VC::release(&value);
                    Ok((true, node.addr))
                }
            };
        }

        let idx = node.child_for::<O>(key);
        let child_addr = node.index_entries()[idx].1;
        let child = self.store.get_xl(child_addr, wu)?;

        let (mut node, idx, child) = if child.is_underflow(&self.cfg) {
            self.rebalance_child(node, ancestor_shared, idx, child, children_shared, wu, privatized)?
        } else {
            (node, idx, child)
        };

        let (removed, new_child_addr) = self.remove_rec(child, children_shared, key, wu, privatized)?;

        if new_child_addr != node.index_entries()[idx].1 {
            node = self.fork_if_shared(node, ancestor_shared, privatized)?;
            node.replace_child_addr(idx, new_child_addr);
        }

        let new_child_min = {
            let child_peek = self.store.get_sl(new_child_addr, wu)?;
            child_peek.min_key()
        };
        if let Some(min) = new_child_min {
            if min != node.index_entries()[idx].0 {
                node = self.fork_if_shared(node, ancestor_shared, privatized)?;
                node.replace_child_key(idx, min);
            }
        }

        node = self.collapse_root_if_needed(node, ancestor_shared, wu, privatized)?;

        Ok((removed, node.addr))
    }

    /// Ensures the child at `idx` (already write-locked as `child`,
    /// already known to be at or below the minimum fanout) has more than
    /// the minimum before the caller descends into it: a rotation from
    /// whichever sibling has spare entries, preferring the right sibling
    /// when both qualify (§4.3's tie-break), or else a merge with the
    /// left sibling if one exists, else the right. Returns the (possibly
    /// forked) parent, the (possibly shifted, if a left-merge occurred)
    /// index to descend into, and that child's write-locked guard.
    ///
    /// `ancestor_shared` governs whether `node` itself needs forking;
    /// `children_shared` (node's own shared status, computed by the
    /// caller before any of this) governs `child`/`left`/`right`, all of
    /// which are node's children and so share its transitive-sharing
    /// status regardless of which one ends up forked or merged away.
    fn rebalance_child<'w>(
        &self,
        node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        idx: usize,
        child: St::WriteGuard<'w>,
        children_shared: bool,
        wu: &'w WorkUnit,
        privatized: &mut HashSet<u64>,
    ) -> Result<(St::WriteGuard<'w>, usize, St::WriteGuard<'w>), TreeError> {
        let n = node.index_entries().len();
        let has_left = idx > 0;
        let has_right = idx + 1 < n;

        let left = if has_left {
            Some(self.store.get_xl(node.index_entries()[idx - 1].1, wu)?)
        } else {
            None
        };
        let right = if has_right {
            Some(self.store.get_xl(node.index_entries()[idx + 1].1, wu)?)
        } else {
            None
        };

        let right_rotatable = right.as_ref().is_some_and(|r| r.len() > self.cfg.min_fanout);
        let left_rotatable = left.as_ref().is_some_and(|l| l.len() > self.cfg.min_fanout);

        if right_rotatable {
            drop(left);
            return self.rotate_from_right(
                node,
                ancestor_shared,
                idx,
                child,
                right.unwrap(),
                children_shared,
                privatized,
            );
        }
        if left_rotatable {
            drop(right);
            return self.rotate_from_left(
                node,
                ancestor_shared,
                idx,
                left.unwrap(),
                child,
                children_shared,
                privatized,
            );
        }
        if has_left {
            drop(right);
            return self.merge_with_left(
                node,
                ancestor_shared,
                idx,
                left.unwrap(),
                child,
                children_shared,
                privatized,
            );
        }
        self.merge_with_right(
            node,
            ancestor_shared,
            idx,
            child,
            right.expect("a non-root, non-leftmost-only child always has a left or right sibling"),
            children_shared,
            privatized,
        )
    }

    fn rotate_from_right<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        idx: usize,
        child: St::WriteGuard<'w>,
        right: St::WriteGuard<'w>,
        children_shared: bool,
        privatized: &mut HashSet<u64>,
    ) -> Result<(St::WriteGuard<'w>, usize, St::WriteGuard<'w>), TreeError> {
        let mut child = self.fork_if_shared(child, children_shared, privatized)?;
        let mut right = self.fork_if_shared(right, children_shared, privatized)?;
        right.move_min_to(&mut child);
        let new_right_min = right
            .min_key()
            .expect("right sibling still non-empty after giving up one entry to a rotation");

        node = self.fork_if_shared(node, ancestor_shared, privatized)?;
        node.replace_child_addr(idx, child.addr);
        node.replace_child_addr(idx + 1, right.addr);
        node.replace_child_key(idx + 1, new_right_min);

        Ok((node, idx, child))
    }

    fn rotate_from_left<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        idx: usize,
        left: St::WriteGuard<'w>,
        child: St::WriteGuard<'w>,
        children_shared: bool,
        privatized: &mut HashSet<u64>,
    ) -> Result<(St::WriteGuard<'w>, usize, St::WriteGuard<'w>), TreeError> {
        let mut left = self.fork_if_shared(left, children_shared, privatized)?;
        let mut child = self.fork_if_shared(child, children_shared, privatized)?;
        left.move_max_to(&mut child);
        let new_child_min = child
            .min_key()
            .expect("child still non-empty after receiving an entry from a rotation");

        node = self.fork_if_shared(node, ancestor_shared, privatized)?;
        node.replace_child_addr(idx - 1, left.addr);
        node.replace_child_addr(idx, child.addr);
        node.replace_child_key(idx, new_child_min);

        Ok((node, idx, child))
    }

    fn merge_with_left<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        idx: usize,
        left: St::WriteGuard<'w>,
        child: St::WriteGuard<'w>,
        children_shared: bool,
        privatized: &mut HashSet<u64>,
    ) -> Result<(St::WriteGuard<'w>, usize, St::WriteGuard<'w>), TreeError> {
        let mut left = self.fork_if_shared(left, children_shared, privatized)?;
        // `child` is being merged away and dropped, never mutated: if it's
        // still reachable from another clone through `node`'s unforked
        // copy, only its refcount (via `dealloc` below) may change.
        let child_body = child.cloned_body();
        let child_addr = child.addr;
        drop(child);
        left.merge_into_left(child_body);

        node = self.fork_if_shared(node, ancestor_shared, privatized)?;
        node.replace_child_addr(idx - 1, left.addr);
        node.remove_child_at(idx);
        self.store.dealloc(child_addr)?;

        Ok((node, idx - 1, left))
    }

    fn merge_with_right<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        idx: usize,
        child: St::WriteGuard<'w>,
        right: St::WriteGuard<'w>,
        children_shared: bool,
        privatized: &mut HashSet<u64>,
    ) -> Result<(St::WriteGuard<'w>, usize, St::WriteGuard<'w>), TreeError> {
        let mut child = self.fork_if_shared(child, children_shared, privatized)?;
        // Same reasoning as `merge_with_left`: `right` is dropped, not
        // mutated, since it may still be reachable from another clone.
        let right_body = right.cloned_body();
        let right_addr = right.addr;
        drop(right);
        child.merge_into_left(right_body);

        node = self.fork_if_shared(node, ancestor_shared, privatized)?;
        node.replace_child_addr(idx, child.addr);
        node.remove_child_at(idx + 1);
        self.store.dealloc(right_addr)?;

        Ok((node, idx, child))
    }

    /// §4.3's root-collapse rule: if a merge just dropped the root index
    /// to a single entry, absorb that sole child's content directly into
    /// the root and free the child's page, shrinking the tree's depth by
    /// one. A no-op for anything but a 1-entry root index.
    fn collapse_root_if_needed<'w>(
        &self,
        mut node: St::WriteGuard<'w>,
        ancestor_shared: bool,
        wu: &'w WorkUnit,
        privatized: &mut HashSet<u64>,
    ) -> Result<St::WriteGuard<'w>, TreeError> {
        if node.is_root && !node.is_leaf() && node.index_entries().len() == 1 {
            let sole_addr = node.index_entries()[0].1;
            let sole = self.store.get_xl(sole_addr, wu)?;
            // `sole` is about to be replaced by the root absorbing its
            // content; it may still be shared, so its body is cloned out
            // rather than taken, same as a sibling merge.
            let body = sole.cloned_body();
            drop(sole);

            node = self.fork_if_shared(node, ancestor_shared, privatized)?;
            node.install_body(body);
            self.store.dealloc(sole_addr)?;
        }
        Ok(node)
    }

    // ---------------------------------------------------------------
    // Range operations
    // ---------------------------------------------------------------

    pub fn lookup_range(
        &self,
        lo: &Key<KEY_LEN>,
        hi: &Key<KEY_LEN>,
        max_n: usize,
    ) -> Result<(Vec<Key<KEY_LEN>>, Vec<VC::Value>, usize), TreeError> {
        let mut out_keys = Vec::new();
        let mut out_values = Vec::new();
        if self.root == NIL_ADDR || max_n == 0 || O::cmp(lo, hi) == Ordering::Greater {
            return Ok((out_keys, out_values, 0));
        }
        let wu = WorkUnit::new();

        let mut stack = Vec::new();
        let mut node = self.store.get_sl(self.root, &wu)?;
        while !node.is_leaf() {
            let idx = node.child_for::<O>(lo);
            let child_addr = node.index_entries()[idx].1;
            let child = self.store.get_sl(child_addr, &wu)?;
            stack.push((node, idx + 1));
            node = child;
        }

        let mut n_found = 0usize;
        'outer: loop {
            for (key, value) in node.leaf_entries() {
                if O::cmp(key, lo) == Ordering::Less {
                    continue;
                }
                if O::cmp(key, hi) == Ordering::Greater {
                    break 'outer;
                }
                out_keys.push(*key);
                out_values.push(value.clone());
                n_found += 1;
                if n_found == max_n {
                    break 'outer;
                }
            }
            drop(node);
            loop {
                match stack.pop() {
                    None => break 'outer,
                    Some((ancestor, next_idx)) => {
                        if next_idx < ancestor.index_entries().len() {
                            let cursor_addr = ancestor.index_entries()[next_idx].1;
                            stack.push((ancestor, next_idx + 1));
                            let mut cursor = self.store.get_sl(cursor_addr, &wu)?;
                            while !cursor.is_leaf() {
                                let child_addr = cursor.index_entries()[0].1;
                                let deeper = self.store.get_sl(child_addr, &wu)?;
                                stack.push((cursor, 1));
                                cursor = deeper;
                            }
                            node = cursor;
                            break;
                        }
                        // This ancestor is exhausted too; keep popping up.
                    }
                }
            }
            if n_found >= max_n {
                break;
            }
        }

        wu.finish();
        Ok((out_keys, out_values, n_found))
    }

    pub fn insert_range(
        &mut self,
        keys: &[Key<KEY_LEN>],
        values: &[VC::Value],
    ) -> Result<usize, TreeError> {
        assert_eq!(
            keys.len(),
            values.len(),
            "insert_range: keys and values must be the same length"
        );
        if keys.len() > MAX_RANGE_BATCH {
            return Err(TreeError::BatchTooLarge {
                given: keys.len(),
                max: MAX_RANGE_BATCH,
            });
        }
        #[cfg(debug_assertions)]
        for pair in keys.windows(2) {
            debug_assert_eq!(
                O::cmp(&pair[0], &pair[1]),
                Ordering::Less,
                "insert_range requires sorted, duplicate-free keys"
            );
        }
        let mut n_replaced = 0;
        for (key, value) in keys.iter().zip(values.iter()) {
            if self.insert(*key, value.clone())? {
                n_replaced += 1;
            }
        }
        Ok(n_replaced)
    }

    /// Removes every key in `[lo, hi]`. The spec's optimization of
    /// `dealloc`-ing wholly-contained subtrees in one step (avoiding a
    /// per-key descent) is not implemented here; this collects the
    /// matching keys via [`Tree::lookup_range`] and removes them one at a
    /// time. Semantically equivalent — §8's idempotence property (a
    /// second `remove_range` over the same interval returns 0) and S3/S5
    /// hold either way — just not the original's batched fast path.
    pub fn remove_range(&mut self, lo: &Key<KEY_LEN>, hi: &Key<KEY_LEN>) -> Result<usize, TreeError> {
        let (keys, _, _) = self.lookup_range(lo, hi, usize::MAX)?;
        let mut n_removed = 0;
        for key in &keys {
            if self.remove(key)? {
                n_removed += 1;
            }
        }
        Ok(n_removed)
    }

    // ---------------------------------------------------------------
    // Validation / introspection (debug operations, §4.4, §8)
    // ---------------------------------------------------------------

    pub fn reachable_addresses(&self) -> Result<Vec<u64>, TreeError> {
        let mut out = Vec::new();
        if self.root != NIL_ADDR {
            let wu = WorkUnit::new();
            self.collect_addresses(self.root, &mut out, &wu)?;
            wu.finish();
        }
        Ok(out)
    }

    fn collect_addresses(&self, addr: u64, out: &mut Vec<u64>, wu: &WorkUnit) -> Result<(), TreeError> {
        out.push(addr);
        let children: Vec<u64> = {
            let node = self.store.get_sl(addr, wu)?;
            if node.is_leaf() {
                Vec::new()
            } else {
                node.index_entries().iter().map(|(_, a)| *a).collect()
            }
        };
        for child in children {
            self.collect_addresses(child, out, wu)?;
        }
        Ok(())
    }

    pub fn iter<F: FnMut(u64)>(&self, mut visitor: F) -> Result<(), TreeError> {
        for addr in self.reachable_addresses()? {
            visitor(addr);
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    pub fn validate(&self) -> Result<bool, TreeError> {
        if self.root == NIL_ADDR {
            return Ok(true);
        }
        let wu = WorkUnit::new();
        let result = self.validate_node(self.root, true, &wu)?;
        wu.finish();
        Ok(result.is_some())
    }

    #[cfg(debug_assertions)]
    fn validate_node(&self, addr: u64, is_root: bool, wu: &WorkUnit) -> Result<Option<usize>, TreeError> {
        let node = self.store.get_sl(addr, wu)?;
        if node.addr != addr || node.is_root != is_root {
            return Ok(None);
        }
        let len = node.len();
        if is_root {
            if len == 0 || len > self.cfg.root_fanout {
                return Ok(None);
            }
        } else if len < self.cfg.min_fanout || len > self.cfg.non_root_fanout {
            return Ok(None);
        }
        node.debug_check_ordering::<O>();
        if node.is_leaf() {
            return Ok(Some(0));
        }
        let entries: Vec<(Key<KEY_LEN>, u64)> = node.index_entries().to_vec();
        drop(node);

        let mut depth = None;
        for (key, child_addr) in entries {
            let child_min = {
                let child = self.store.get_sl(child_addr, wu)?;
                child.min_key()
            };
            if child_min != Some(key) {
                return Ok(None);
            }
            match self.validate_node(child_addr, false, wu)? {
                None => return Ok(None),
                Some(d) => match depth {
                    None => depth = Some(d + 1),
                    Some(prev) if prev != d + 1 => return Ok(None),
                    _ => {}
                },
            }
        }
        Ok(depth)
    }

    #[cfg(debug_assertions)]
    pub fn validate_clones(trees: &[&Self]) -> Result<bool, TreeError> {
        use std::collections::HashMap;

        if trees.is_empty() {
            return Ok(true);
        }
        let store = &trees[0].store;
        let mut counts: HashMap<u64, u32> = HashMap::new();
        for tree in trees {
            if !tree.validate()? {
                return Ok(false);
            }
            for addr in tree.reachable_addresses()? {
                *counts.entry(addr).or_insert(0) += 1;
            }
        }
        for (addr, count) in &counts {
            if store.fs_get_refcount(*addr)? != *count {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FanoutConfig, LexicographicOrder, PlainValue};
    use crate::store::MemStore;
    use std::collections::BTreeMap;

    const KEY_LEN: usize = 4;
    type TestTree = Tree<KEY_LEN, MemStore<KEY_LEN, u32>, LexicographicOrder, PlainValue<u32>>;

    fn k(n: u32) -> Key<KEY_LEN> {
        n.to_be_bytes()
    }

    fn small_fanout() -> FanoutConfig {
        FanoutConfig::new(5, 5, 2)
    }

    fn tree(cfg: FanoutConfig) -> TestTree {
        Tree::init(Arc::new(MemStore::new()), cfg, 1)
    }

    #[test]
    fn s1_split_on_overflow() {
        let mut t = tree(small_fanout());
        for i in 0..6 {
            assert!(!t.insert(k(i), i).unwrap());
        }
        assert!(t.validate().unwrap());
        for i in 0..6 {
            assert_eq!(t.lookup(&k(i)).unwrap(), Some(i));
        }
    }

    #[test]
    fn s2_remove_triggers_merge() {
        let mut t = tree(small_fanout());
        for i in 0..10 {
            t.insert(k(i), i).unwrap();
        }
        for i in 0..8 {
            assert!(t.remove(&k(i)).unwrap());
            assert!(t.validate().unwrap());
        }
        for i in 0..8 {
            assert_eq!(t.lookup(&k(i)).unwrap(), None);
        }
        for i in 8..10 {
            assert_eq!(t.lookup(&k(i)).unwrap(), Some(i));
        }
    }

    #[test]
    fn s3_lookup_range_across_leaves() {
        let mut t = tree(small_fanout());
        for i in 0..20 {
            t.insert(k(i), i * 10).unwrap();
        }
        let (keys, values, n) = t.lookup_range(&k(5), &k(14), usize::MAX).unwrap();
        assert_eq!(n, 10);
        assert_eq!(keys, (5..15).map(k).collect::<Vec<_>>());
        assert_eq!(values, (5..15).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn s4_clone_is_copy_on_write_isolated() {
        let mut a = tree(small_fanout());
        for i in 0..20 {
            a.insert(k(i), i).unwrap();
        }
        let mut b = a.clone_tree(2).unwrap();

        for i in 0..20 {
            assert_eq!(b.lookup(&k(i)).unwrap(), Some(i));
        }

        b.insert(k(3), 999).unwrap();
        b.remove(&k(7)).unwrap();

        assert_eq!(a.lookup(&k(3)).unwrap(), Some(3));
        assert_eq!(a.lookup(&k(7)).unwrap(), Some(7));
        assert_eq!(b.lookup(&k(3)).unwrap(), Some(999));
        assert_eq!(b.lookup(&k(7)).unwrap(), None);

        assert!(a.validate().unwrap());
        assert!(b.validate().unwrap());
        assert!(TestTree::validate_clones(&[&a, &b]).unwrap());
    }

    #[test]
    fn s5_delete_clone_leaves_sibling_intact() {
        let mut a = tree(small_fanout());
        for i in 0..20 {
            a.insert(k(i), i).unwrap();
        }
        let mut b = a.clone_tree(2).unwrap();
        b.delete().unwrap();
        assert!(b.is_empty_state());
        for i in 0..20 {
            assert_eq!(a.lookup(&k(i)).unwrap(), Some(i));
        }
        assert!(a.validate().unwrap());
    }

    #[test]
    fn s6_insert_range_reports_replacements() {
        let mut t = tree(small_fanout());
        t.insert(k(2), 2).unwrap();
        t.insert(k(4), 4).unwrap();
        let keys: Vec<_> = (0..6).map(k).collect();
        let values: Vec<_> = (0..6).map(|i| i * 100).collect();
        let n_replaced = t.insert_range(&keys, &values).unwrap();
        assert_eq!(n_replaced, 2);
        assert!(t.validate().unwrap());
        for i in 0..6 {
            assert_eq!(t.lookup(&k(i)).unwrap(), Some(i * 100));
        }
    }

    #[test]
    fn insert_range_rejects_batch_over_limit() {
        let mut t = tree(small_fanout());
        let keys: Vec<_> = (0..(MAX_RANGE_BATCH as u32 + 1)).map(k).collect();
        let values = keys.iter().map(|_| 0u32).collect::<Vec<_>>();
        let err = t.insert_range(&keys, &values).unwrap_err();
        match err {
            TreeError::BatchTooLarge { given, max } => {
                assert_eq!(given, MAX_RANGE_BATCH + 1);
                assert_eq!(max, MAX_RANGE_BATCH);
            }
            other => panic!("expected BatchTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn remove_range_is_idempotent() {
        let mut t = tree(small_fanout());
        for i in 0..30 {
            t.insert(k(i), i).unwrap();
        }
        let first = t.remove_range(&k(5), &k(20)).unwrap();
        assert_eq!(first, 16);
        let second = t.remove_range(&k(5), &k(20)).unwrap();
        assert_eq!(second, 0);
        assert!(t.validate().unwrap());
        let (_, _, n) = t.lookup_range(&k(0), &k(29), usize::MAX).unwrap();
        assert_eq!(n, 30 - 16);
    }

    #[test]
    fn random_sequence_matches_btreemap_oracle() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(42);
        let mut t = tree(small_fanout());
        let mut oracle: BTreeMap<u32, u32> = BTreeMap::new();

        for _ in 0..2000 {
            let key = rng.gen_range(0..200);
            if rng.gen_bool(0.7) {
                let value = rng.gen::<u32>();
                let replaced = t.insert(k(key), value).unwrap();
                let oracle_replaced = oracle.insert(key, value).is_some();
                assert_eq!(replaced, oracle_replaced);
            } else {
                let removed = t.remove(&k(key)).unwrap();
                let oracle_removed = oracle.remove(&key).is_some();
                assert_eq!(removed, oracle_removed);
            }
        }

        for (key, value) in &oracle {
            assert_eq!(t.lookup(&k(*key)).unwrap(), Some(*value));
        }
        assert!(t.validate().unwrap());

        let (keys, values, n) = t.lookup_range(&k(0), &k(199), usize::MAX).unwrap();
        assert_eq!(n, oracle.len());
        let expected_keys: Vec<_> = oracle.keys().map(|key| k(*key)).collect();
        let expected_values: Vec<_> = oracle.values().copied().collect();
        assert_eq!(keys, expected_keys);
        assert_eq!(values, expected_values);
    }

    #[test]
    fn clone_chain_stays_consistent_under_divergent_mutation() {
        let mut base = tree(small_fanout());
        for i in 0..50 {
            base.insert(k(i), i).unwrap();
        }
        let mut clones: Vec<TestTree> = Vec::new();
        for tid in 2..5 {
            let mut c = base.clone_tree(tid).unwrap();
            for i in 0..tid as u32 {
                c.insert(k(i * 7 % 50), 1000 + tid as u32).unwrap();
            }
            clones.push(c);
        }

        assert!(base.validate().unwrap());
        for c in &clones {
            assert!(c.validate().unwrap());
        }
        let refs: Vec<&TestTree> = std::iter::once(&base).chain(clones.iter()).collect();
        assert!(TestTree::validate_clones(&refs).unwrap());

        for i in 0..50 {
            assert_eq!(base.lookup(&k(i)).unwrap(), Some(i));
        }
    }
}
