#![forbid(unsafe_code)]
//! DittoFS replication layer.
//!
//! Sits on top of [`dfs_fs`] and gives damaged content somewhere to go:
//!
//! - [`DittoManager`] is the operational surface: verified and forced reads,
//!   on-demand replication (`duplicate`), replica freshening after namespace
//!   changes (`refresh`), and `rescue`, which copies a healthy replica back
//!   over a corrupted primary.
//! - [`Propagation`] copies content between inodes in chunks, one
//!   transaction per chunk, sized so a chunk's writes always fit the log.
//!
//! Detection itself lives in the filesystem layer (`InodeGuard::verify`);
//! this crate decides when to check, when to bypass the check, and how to
//! repair.

pub mod manager;
pub mod propagate;

pub use manager::{DittoManager, REPLICA_SLOTS};
pub use propagate::{Propagation, chunk_bytes};
