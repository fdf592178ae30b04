#![forbid(unsafe_code)]
//! Error types for DittoFS.
//!
//! # Error Taxonomy
//!
//! DittoFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `DfsError` | `dfs-error` (this crate) | User-facing errors for CLI, harness, and API consumers |
//!
//! ## Mapping Policy: ParseError → DfsError
//!
//! `dfs-error` is intentionally independent of `dfs-types` and `dfs-ondisk` to
//! avoid cyclic dependencies. The conversion from `ParseError` to `DfsError`
//! happens at the crate boundaries that depend on both (`dfs-fs` mount paths).
//! Mount-time parse failures become `Format`; geometry violations detected by
//! superblock validation become `InvalidGeometry`.
//!
//! ## errno Mapping
//!
//! Every `DfsError` variant maps to exactly one POSIX errno via
//! [`DfsError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its errno is assigned. The
//! CLI exits with this value, so scripted scenarios can tell a corrupted file
//! (`EIO`) from a missing one (`ENOENT`).
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `Io` | `EIO` | 5 |
//! | `PoolExhausted` | `ENOMEM` | 12 |
//! | `ContractViolation` | `EINVAL` | 22 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `Corrupted` | `EIO` | 5 |
//! | `ReplicaSlotOccupied` | `EEXIST` | 17 |
//! | `NoSpace` | `ENOSPC` | 28 |
//! | `FileTooLarge` | `EFBIG` | 27 |
//! | `Format` | `EINVAL` | 22 |
//! | `Parse` | `EINVAL` | 22 |
//! | `InvalidGeometry` | `EINVAL` | 22 |
//! | `NotDirectory` | `ENOTDIR` | 20 |
//! | `IsDirectory` | `EISDIR` | 21 |
//! | `Exists` | `EEXIST` | 17 |
//! | `NameTooLong` | `ENAMETOOLONG` | 36 |
//!
//! ## Design Constraints
//!
//! - `dfs-error` MUST NOT depend on `dfs-types` or `dfs-ondisk` (no cyclic
//!   deps); error payloads carry raw integers, not newtypes.
//! - `DfsError` is the single user-facing error type; crate-internal errors
//!   (like `ParseError`) convert into `DfsError` at their crate boundaries.
//! - `PoolExhausted` and `ContractViolation` are fatal by policy: they signal
//!   a capacity-planning violation or a caller bug, and are never retried.
//! - `Corrupted` must never be collapsed into `NotFound`; the operator's next
//!   action (forced open, then rescue) is different from "file missing."

use thiserror::Error;

/// Unified error type for all DittoFS operations.
///
/// This is the canonical error type returned by CLI commands, the harness,
/// and public API surfaces. Internal crate-specific errors (e.g., `ParseError`
/// from `dfs-types`) are converted into `DfsError` at crate boundaries.
#[derive(Debug, Error)]
pub enum DfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer cache has no entry that is neither busy nor dirty.
    ///
    /// The pool is sized for the maximum number of simultaneously-held
    /// distinct blocks; hitting this is a capacity-planning violation, not a
    /// transient condition. Callers treat it as fatal and never retry.
    #[error("buffer pool exhausted: all {capacity} entries busy or dirty")]
    PoolExhausted { capacity: usize },

    /// API misuse detected at runtime.
    ///
    /// Recording a block with no transaction open, overflowing a
    /// transaction's write budget, duplicating a replica inode, or an
    /// internal flag inconsistency. These indicate a bug in the caller, not
    /// a runtime condition to recover from.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// File, directory, or inode not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Content checksum verification failed on a verified open.
    ///
    /// Carries the inode and both checksums so tooling can report exactly
    /// what was expected and what the content now folds to. Recoverable only
    /// through a forced open followed by a rescue from a replica.
    #[error(
        "corrupted content on inode {inode}: stored checksum {stored:#010x}, computed {computed:#010x}"
    )]
    Corrupted {
        inode: u64,
        stored: u32,
        computed: u32,
    },

    /// A `duplicate` request named a replica slot that is already filled.
    ///
    /// Replication never silently overwrites an existing replica; the caller
    /// must pick the free slot or leave the inode as it is.
    #[error("replica slot {slot} of inode {inode} is already occupied")]
    ReplicaSlotOccupied { inode: u64, slot: u8 },

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// Write would extend a file past the direct + indirect block limit.
    #[error("file exceeds the {max_blocks}-block limit")]
    FileTooLarge { max_blocks: usize },

    /// Invalid on-disk format (bad magic, malformed record).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError` from `dfs-types`.
    /// Prefer `Format` or `InvalidGeometry` when mount-validation context is
    /// known.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry is out of order, overlapping, or out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Target already exists (create, mkdir, link).
    #[error("file exists")]
    Exists,

    /// Filename exceeds the 14-byte directory entry limit.
    #[error("name too long")]
    NameTooLong,
}

impl DfsError {
    /// Convert this error into a POSIX errno suitable for CLI exit codes.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm. Adding
    /// a new variant without updating this function is a compile error.
    ///
    /// Policy notes:
    /// - `PoolExhausted` → `ENOMEM`: the fixed buffer pool is a memory
    ///   resource; exhaustion is a sizing bug, reported as allocation failure.
    /// - `Corrupted` → `EIO`: the data is present but damaged; must stay
    ///   distinguishable from `NotFound`'s `ENOENT`.
    /// - `ReplicaSlotOccupied` → `EEXIST`: the slot is a named target that
    ///   already exists, same shape as an exclusive create collision.
    /// - `ContractViolation` → `EINVAL`: caller bug; the argument or call
    ///   sequence was invalid.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::PoolExhausted { .. } => libc::ENOMEM,
            Self::ContractViolation(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Corrupted { .. } => libc::EIO,
            Self::ReplicaSlotOccupied { .. } | Self::Exists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge { .. } => libc::EFBIG,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;
