//! Per-operation resource tracking.
//!
//! Grounded directly in the original's `oc_utl_trk.c`: every lock or pin an
//! operation acquires is recorded in a per-operation set and released on
//! every exit path, including error exits, and a clean completion asserts
//! the set is empty (`oc_utl_trk_finalize`).
//!
//! Rust's ownership makes the bookkeeping unconditional: a node acquired
//! through [`crate::store::NodeStore`] comes back as a guard whose `Drop`
//! releases the underlying lock and pin, so "release on every exit path"
//! falls out of ordinary scope exit rather than a manual unwind handler.
//! [`WorkUnit`] is the part of the original design that doesn't
//! disappear into `Drop`: a live counter of guards an operation is
//! currently holding, so a `debug_assert_eq!` at the end of every public
//! operation can still check the set is empty, exactly as
//! `oc_utl_trk_finalize` did.
use std::cell::Cell;

/// Tracks the number of node guards (locks + pins, folded into one guard
/// type by this crate) currently outstanding for a single operation.
///
/// Not `Sync`: a `WorkUnit` belongs to the single call stack executing one
/// public operation, the same scope the original's per-operation work-unit
/// context was confined to.
#[derive(Debug, Default)]
pub struct WorkUnit {
    outstanding: Cell<usize>,
}

impl WorkUnit {
    pub fn new() -> Self {
        Self {
            outstanding: Cell::new(0),
        }
    }

    pub(crate) fn acquire(&self) {
        self.outstanding.set(
            self.outstanding
                .get()
                .checked_add(1)
                .expect("resource tracker: too many outstanding guards"),
        );
    }

    pub(crate) fn release(&self) {
        self.outstanding.set(
            self.outstanding
                .get()
                .checked_sub(1)
                .expect("resource tracker: released a guard that was never acquired"),
        );
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Asserts that every guard checked out during this operation has
    /// already been released. Intended to run once at the tail of every
    /// public `Tree` method, the direct analogue of `oc_utl_trk_finalize`.
    pub fn finish(&self) {
        debug_assert_eq!(
            self.outstanding(),
            0,
            "resource tracker: operation finished with {} outstanding lock/pin(s)",
            self.outstanding()
        );
    }
}

impl Drop for WorkUnit {
    fn drop(&mut self) {
        self.finish();
    }
}
