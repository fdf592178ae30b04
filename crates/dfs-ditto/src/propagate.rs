//! Chunked content propagation between inodes.
//!
//! Copying a whole file in one transaction would overflow the log, so a
//! [`Propagation`] walks the source in fixed-size chunks and gives every
//! chunk its own operation. Source and destination are locked sequentially,
//! never at the same time, so propagation cannot deadlock with path walks
//! or with other propagations.

use dfs_error::{DfsError, Result};
use dfs_fs::Fs;
use dfs_types::{InodeNumber, SECTOR_SIZE};
use tracing::debug;

/// Bytes of content one propagation chunk may carry.
///
/// A chunk's transaction dirties its data blocks plus the inode table slot,
/// the indirect block, and a block of allocation bitmap; halving what is
/// left of the log keeps two interleaved propagations inside capacity.
#[must_use]
pub fn chunk_bytes(fs: &Fs) -> usize {
    let slots = fs.log().capacity_blocks();
    ((slots - 1 - 2) / 2) * SECTOR_SIZE
}

/// One source-to-destination content copy in transaction-sized steps.
#[derive(Debug)]
pub struct Propagation<'a> {
    fs: &'a Fs,
    src: InodeNumber,
    dst: InodeNumber,
    offset: u64,
    len: u64,
    chunk: usize,
}

impl<'a> Propagation<'a> {
    /// Prepare a copy of `src`'s current content into `dst`.
    pub fn new(fs: &'a Fs, src: InodeNumber, dst: InodeNumber) -> Result<Self> {
        if src == dst {
            return Err(DfsError::ContractViolation(format!(
                "propagation from inode {src} onto itself"
            )));
        }
        let node = fs.inode(src);
        let guard = node.lock(fs)?;
        let len = u64::from(guard.record().size);
        drop(guard);
        Ok(Self {
            fs,
            src,
            dst,
            offset: 0,
            len,
            chunk: chunk_bytes(fs),
        })
    }

    /// Copy the next chunk in its own transaction. Returns `false` once the
    /// source is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        if self.offset >= self.len {
            return Ok(false);
        }

        let count = self.chunk.min((self.len - self.offset) as usize);
        let mut buf = vec![0u8; count];
        {
            let node = self.fs.inode(self.src);
            let guard = node.lock(self.fs)?;
            let read = guard.read_at(self.offset, &mut buf)?;
            buf.truncate(read);
        }
        if buf.is_empty() {
            return Ok(false);
        }

        let op = self.fs.log().begin_op();
        {
            let node = self.fs.inode(self.dst);
            let mut guard = node.lock(self.fs)?;
            guard.write_at(self.offset, &buf)?;
        }
        op.end()?;

        self.offset += buf.len() as u64;
        debug!(
            target: "dfs::ditto",
            src = %self.src,
            dst = %self.dst,
            offset = self.offset,
            len = self.len,
            "propagated chunk"
        );
        Ok(self.offset < self.len)
    }

    /// Wipe the destination, then run every step to completion.
    pub fn run(mut self) -> Result<()> {
        let op = self.fs.log().begin_op();
        {
            let node = self.fs.inode(self.dst);
            let mut guard = node.lock(self.fs)?;
            guard.truncate()?;
        }
        op.end()?;

        while self.step()? {}
        Ok(())
    }
}
