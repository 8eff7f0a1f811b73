//! Typed errors for the boundaries named in the error-handling design: duplicate
//! keys, unsupported table formats, and cancelled stalls. Everything else
//! (iterator composition, internal plumbing) keeps propagating with `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A memtable insert targeted a key that already exists. Non-fatal: callers
    /// observe this as `insert` returning `false`, not as a propagated error, but
    /// it is named here so alternate call sites (e.g. a future batch API) have a
    /// typed way to report it.
    #[error("duplicate key")]
    DuplicateKey,

    /// Adaptive table dispatch read a footer whose magic number names no
    /// registered reader factory.
    #[error("unsupported table format: magic {0:#x}")]
    UnsupportedFormat(u64),

    /// A stall handle was signalled by cancellation rather than by
    /// `maybe_end_write_stall` reaching a natural end. The default stall handle
    /// never raises this; it exists for callers that plug in a cancellable one.
    #[error("write stall wait was cancelled")]
    StallWaitCancelled,

    #[error("checksum mismatch: {0}")]
    Corruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
