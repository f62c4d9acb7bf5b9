use std::fmt;
use std::sync::PoisonError;

/// Failure modes surfaced by a [`crate::store::NodeStore`] implementation.
///
/// Mirrors the plain-enum, manually-`Display`ed error style used by the
/// pile's blob store: one variant per failure shape, a `From<PoisonError<_>>`
/// impl so `?` works across a lock acquisition, no `thiserror`.
#[derive(Debug)]
pub enum StoreError {
    /// A lock guarding a page or the store's allocation table was poisoned
    /// by a panic in another thread.
    Poisoned,
    /// A page address was looked up that the store has never allocated, or
    /// has already freed.
    UnknownAddress(u64),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Poisoned => write!(f, "node store lock poisoned"),
            StoreError::UnknownAddress(addr) => {
                write!(f, "unknown or freed page address {addr}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_err: PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}

/// Failure modes surfaced directly by tree operations, as opposed to their
/// backing store.
#[derive(Debug)]
pub enum TreeError {
    /// The underlying store failed.
    Store(StoreError),
    /// `insert_range`/`remove_range` was given more entries than the
    /// implementation-chosen batch size (see [`crate::config::MAX_RANGE_BATCH`]).
    BatchTooLarge { given: usize, max: usize },
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::Store(err) => write!(f, "{err}"),
            TreeError::BatchTooLarge { given, max } => {
                write!(f, "batch of {given} entries exceeds maximum of {max}")
            }
        }
    }
}

impl std::error::Error for TreeError {}

impl From<StoreError> for TreeError {
    fn from(err: StoreError) -> Self {
        TreeError::Store(err)
    }
}

impl<T> From<PoisonError<T>> for TreeError {
    fn from(err: PoisonError<T>) -> Self {
        TreeError::Store(StoreError::from(err))
    }
}
