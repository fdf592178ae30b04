#![forbid(unsafe_code)]
//! Group-commit transaction log.
//!
//! The log occupies `log_blocks` sectors at the tail of the image: one
//! commit header block followed by up to `log_blocks - 1` data slots. A
//! transaction is a group of home blocks recorded between [`TxnLog::begin_op`]
//! and the drop of the returned [`OpGuard`]; concurrent operations share one
//! group, and the last operation out commits it.
//!
//! Commit protocol:
//!
//! 1. copy each recorded home block's current content into its log slot,
//! 2. write the header naming the homes — this write is the commit point,
//! 3. clear the header, then unpin every recorded block in the cache.
//!
//! Home positions are kept current by the cache's write-through
//! `mark_dirty`, so installation needs no extra writes; the slots exist so
//! [`replay`] can redo a committed group found in the header after a crash.
//!
//! The header carries a crc32c over the whole block; a header that fails the
//! checksum (a torn commit) is treated as empty and normalized.

use dfs_block::{BufCache, ByteDevice};
use dfs_error::{DfsError, Result};
use dfs_ondisk::Superblock;
use dfs_types::{BlockNumber, DeviceId, ParseError, SECTOR_SIZE, read_le_u32, write_le_u32};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Upper bound on blocks a single operation may record. Admission control
/// reserves this much per outstanding operation.
pub const MAX_OP_BLOCKS: usize = 10;

/// Home-block addresses that fit the header after count and crc.
pub const LOG_HEADER_SLOTS: usize = (SECTOR_SIZE - 8) / 4;

/// Commit header, stored in the first log block.
///
/// | offset | field                        |
/// |--------|------------------------------|
/// | 0      | `count` (u32)                |
/// | 4      | crc32c of the block, crc = 0 |
/// | 8      | `count` × u32 home blocks    |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub homes: Vec<u32>,
}

impl LogHeader {
    #[must_use]
    pub fn empty() -> Self {
        Self { homes: Vec::new() }
    }

    /// Parse and checksum-verify a header block.
    pub fn parse(block: &[u8]) -> std::result::Result<Self, ParseError> {
        if block.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let count = read_le_u32(block, 0)? as usize;
        if count > LOG_HEADER_SLOTS {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "exceeds header slot capacity",
            });
        }

        let stored_crc = read_le_u32(block, 4)?;
        let mut scratch = [0_u8; SECTOR_SIZE];
        scratch.copy_from_slice(&block[..SECTOR_SIZE]);
        write_le_u32(&mut scratch, 4, 0)?;
        let computed = crc32c::crc32c(&scratch);
        if computed != stored_crc {
            return Err(ParseError::InvalidField {
                field: "crc",
                reason: "checksum mismatch",
            });
        }

        let mut homes = Vec::with_capacity(count);
        for i in 0..count {
            homes.push(read_le_u32(block, 8 + i * 4)?);
        }
        Ok(Self { homes })
    }

    /// Encode into one block, stamping the crc last.
    pub fn encode_into(&self, block: &mut [u8]) -> std::result::Result<(), ParseError> {
        if block.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        if self.homes.len() > LOG_HEADER_SLOTS {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "exceeds header slot capacity",
            });
        }

        block[..SECTOR_SIZE].fill(0);
        write_le_u32(block, 0, self.homes.len() as u32)?;
        for (i, home) in self.homes.iter().enumerate() {
            write_le_u32(block, 8 + i * 4, *home)?;
        }
        let crc = crc32c::crc32c(&block[..SECTOR_SIZE]);
        write_le_u32(block, 4, crc)?;
        Ok(())
    }
}

struct LogState {
    outstanding: usize,
    committing: bool,
    /// Home blocks of the running group, duplicates absorbed.
    queued: Vec<BlockNumber>,
}

/// The transaction log for one device.
pub struct TxnLog {
    cache: Arc<BufCache>,
    device: Arc<dyn ByteDevice>,
    dev: DeviceId,
    start: BlockNumber,
    capacity: usize,
    state: Mutex<LogState>,
    /// Signalled when space frees up or a commit finishes.
    space: Condvar,
}

impl TxnLog {
    /// Bind the log to the region the superblock describes.
    pub fn new(cache: Arc<BufCache>, dev: DeviceId, sb: &Superblock) -> Result<Self> {
        let capacity = sb.log_blocks.saturating_sub(1) as usize;
        if capacity < MAX_OP_BLOCKS {
            return Err(DfsError::InvalidGeometry(format!(
                "log has {capacity} data slots, need at least {MAX_OP_BLOCKS}"
            )));
        }
        let device = cache.device(dev)?;
        Ok(Self {
            cache,
            device,
            dev,
            start: BlockNumber(u64::from(sb.log_start)),
            capacity,
            state: Mutex::new(LogState {
                outstanding: 0,
                committing: false,
                queued: Vec::new(),
            }),
            space: Condvar::new(),
        })
    }

    /// Data slots available to a group, consumed by propagation chunk sizing.
    #[must_use]
    pub fn capacity_blocks(&self) -> usize {
        self.capacity
    }

    /// Open an operation, blocking until the group has room for its worst
    /// case of [`MAX_OP_BLOCKS`] records.
    pub fn begin_op(&self) -> OpGuard<'_> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if !state.committing
                && state.queued.len() + (state.outstanding + 1) * MAX_OP_BLOCKS <= self.capacity
            {
                state.outstanding += 1;
                return OpGuard {
                    log: self,
                    ended: false,
                };
            }
            state = self
                .space
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Add a dirty block to the running group. Duplicates are absorbed.
    ///
    /// Called after `mark_dirty`; the cache keeps the block pinned until the
    /// group commits.
    pub fn record(&self, dev: DeviceId, block: BlockNumber) -> Result<()> {
        if dev != self.dev {
            return Err(DfsError::ContractViolation(format!(
                "block of device {dev} recorded in log of device {}",
                self.dev
            )));
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.outstanding == 0 {
            return Err(DfsError::ContractViolation(
                "record outside begin_op/end_op".to_owned(),
            ));
        }
        if state.queued.contains(&block) {
            return Ok(());
        }
        if state.queued.len() >= self.capacity {
            return Err(DfsError::ContractViolation(format!(
                "transaction group overflows {} log slots",
                self.capacity
            )));
        }
        state.queued.push(block);
        debug!(
            target: "dfs::log",
            block = %block,
            queued = state.queued.len(),
            "recorded block"
        );
        Ok(())
    }

    /// Home blocks queued in the running group.
    #[must_use]
    pub fn pending_blocks(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .len()
    }

    fn end_op(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.outstanding -= 1;
        if state.outstanding > 0 || state.queued.is_empty() {
            drop(state);
            self.space.notify_all();
            return Ok(());
        }

        // Last operation out commits the whole group.
        state.committing = true;
        let queued = std::mem::take(&mut state.queued);
        drop(state);

        let result = self.commit(&queued);

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.committing = false;
        drop(state);
        self.space.notify_all();
        result
    }

    fn commit(&self, queued: &[BlockNumber]) -> Result<()> {
        // Copy group content into the log slots.
        for (i, home) in queued.iter().enumerate() {
            let guard = self.cache.acquire(self.dev, *home)?;
            self.device
                .write_at(self.slot_offset(i + 1)?, &guard.data()[..])?;
            drop(guard);
        }

        // Header write is the commit point.
        let mut homes = Vec::with_capacity(queued.len());
        for home in queued {
            homes.push(
                home.to_u32()
                    .map_err(|err| DfsError::Parse(err.to_string()))?,
            );
        }
        let mut block = [0_u8; SECTOR_SIZE];
        LogHeader { homes }
            .encode_into(&mut block)
            .map_err(|err| DfsError::Parse(err.to_string()))?;
        self.device.write_at(self.slot_offset(0)?, &block)?;

        // Homes are already current via write-through; retire the group.
        LogHeader::empty()
            .encode_into(&mut block)
            .map_err(|err| DfsError::Parse(err.to_string()))?;
        self.device.write_at(self.slot_offset(0)?, &block)?;

        for home in queued {
            self.cache.clear_dirty(self.dev, *home)?;
        }
        info!(
            target: "dfs::log",
            blocks = queued.len(),
            "transaction group committed"
        );
        Ok(())
    }

    fn slot_offset(&self, index: usize) -> Result<u64> {
        self.start
            .checked_add(index as u64)
            .and_then(BlockNumber::byte_offset)
            .ok_or_else(|| DfsError::Format("log slot offset overflows".to_owned()))
    }
}

impl std::fmt::Debug for TxnLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnLog")
            .field("device", &self.dev)
            .field("start", &self.start)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// An open operation. Dropping it ends the operation; the last one out
/// commits the group.
#[must_use = "dropping the guard ends the operation"]
pub struct OpGuard<'a> {
    log: &'a TxnLog,
    ended: bool,
}

impl OpGuard<'_> {
    /// End the operation, surfacing any commit error.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.log.end_op()
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(err) = self.log.end_op() {
            error!(target: "dfs::log", error = %err, "commit failed during implicit end_op");
        }
    }
}

impl std::fmt::Debug for OpGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpGuard")
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

/// Redo a committed group left in the header after a crash.
///
/// Runs raw against the device before the cache sees any block. A header
/// that fails its checksum is treated as empty. The header is normalized to
/// empty afterwards; replay is idempotent. Returns the number of blocks
/// re-installed.
pub fn replay(device: &dyn ByteDevice, sb: &Superblock) -> Result<usize> {
    let start = BlockNumber(u64::from(sb.log_start));
    let header_offset = start
        .byte_offset()
        .ok_or_else(|| DfsError::Format("log start offset overflows".to_owned()))?;

    let mut block = [0_u8; SECTOR_SIZE];
    device.read_at(header_offset, &mut block)?;

    let (header, damaged) = match LogHeader::parse(&block) {
        Ok(header) => (header, false),
        Err(err) => {
            warn!(
                target: "dfs::log",
                error = %err,
                "log header unreadable; treating as empty"
            );
            (LogHeader::empty(), true)
        }
    };

    let mut data = [0_u8; SECTOR_SIZE];
    for (i, home) in header.homes.iter().enumerate() {
        let slot = start
            .checked_add(1 + i as u64)
            .and_then(BlockNumber::byte_offset)
            .ok_or_else(|| DfsError::Format("log slot offset overflows".to_owned()))?;
        let home_offset = BlockNumber(u64::from(*home))
            .byte_offset()
            .ok_or_else(|| DfsError::Format("home block offset overflows".to_owned()))?;
        device.read_at(slot, &mut data)?;
        device.write_at(home_offset, &data)?;
        debug!(target: "dfs::log", home, slot = i, "re-installed block");
    }

    let replayed = header.homes.len();
    if replayed > 0 || damaged {
        LogHeader::empty()
            .encode_into(&mut block)
            .map_err(|err| DfsError::Parse(err.to_string()))?;
        device.write_at(header_offset, &block)?;
    }
    if replayed > 0 {
        info!(target: "dfs::log", blocks = replayed, "log replayed");
    }
    Ok(replayed)
}
