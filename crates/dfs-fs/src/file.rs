//! Block allocation and file content I/O.
//!
//! Files map block 0..11 through `addrs` directly and the next 128 through a
//! single indirect block, for a 140-block ceiling. Writes never leave holes:
//! a write may start anywhere up to the current size, so every block below
//! `size` is mapped once written.
//!
//! Every successful write restamps the inode's content checksum over the
//! full extent, window by window, before the record goes back to the table.
//! Reads fold the same windows, which is what verified opens compare
//! against.

use dfs_error::{DfsError, Result};
use dfs_ondisk::{
    CHECKSUM_WINDOW, ContentChecksum, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, Superblock,
    bitmap_clear, bitmap_get, bitmap_set,
};
use dfs_types::{BlockNumber, SECTOR_SIZE, read_le_u32, write_le_u32};
use tracing::{debug, warn};

use crate::itable::InodeGuard;
use crate::{Fs, parse_err};

impl Fs {
    /// Claim a free data block, zero it, and return it. Runs inside an open
    /// operation.
    pub(crate) fn balloc(&self) -> Result<BlockNumber> {
        let data_start = u64::from(self.sb.data_start);
        let data_end = data_start + u64::from(self.sb.data_blocks);

        let mut candidate = data_start;
        while candidate < data_end {
            let map_block = self.sb.bitmap_block_for(BlockNumber(candidate));
            let mut map = self.cache.acquire(self.dev, map_block)?;
            let mut claimed = None;
            while candidate < data_end
                && self.sb.bitmap_block_for(BlockNumber(candidate)) == map_block
            {
                let bit = Superblock::bitmap_bit_for(BlockNumber(candidate));
                if !bitmap_get(map.data(), bit).map_err(parse_err)? {
                    bitmap_set(map.data_mut(), bit).map_err(parse_err)?;
                    claimed = Some(BlockNumber(candidate));
                    break;
                }
                candidate += 1;
            }
            let Some(block) = claimed else {
                drop(map);
                continue;
            };
            map.mark_dirty()?;
            drop(map);
            self.log.record(self.dev, map_block)?;
            self.zero_block(block)?;
            debug!(target: "dfs::fs", block = %block, "allocated block");
            return Ok(block);
        }
        Err(DfsError::NoSpace)
    }

    /// Return a data block to the bitmap. Freeing a block that is already
    /// free is a caller bug.
    pub(crate) fn bfree(&self, block: BlockNumber) -> Result<()> {
        let data_start = u64::from(self.sb.data_start);
        let data_end = data_start + u64::from(self.sb.data_blocks);
        if block.0 < data_start || block.0 >= data_end {
            return Err(DfsError::ContractViolation(format!(
                "freeing block {block} outside the data region"
            )));
        }

        let map_block = self.sb.bitmap_block_for(block);
        let bit = Superblock::bitmap_bit_for(block);
        let mut map = self.cache.acquire(self.dev, map_block)?;
        if !bitmap_get(map.data(), bit).map_err(parse_err)? {
            return Err(DfsError::ContractViolation(format!(
                "freeing free block {block}"
            )));
        }
        bitmap_clear(map.data_mut(), bit).map_err(parse_err)?;
        map.mark_dirty()?;
        drop(map);
        self.log.record(self.dev, map_block)?;
        debug!(target: "dfs::fs", block = %block, "freed block");
        Ok(())
    }

    fn zero_block(&self, block: BlockNumber) -> Result<()> {
        let mut guard = self.cache.acquire(self.dev, block)?;
        guard.data_mut().fill(0);
        guard.mark_dirty()?;
        drop(guard);
        self.log.record(self.dev, block)
    }
}

impl InodeGuard<'_> {
    /// Map file block `fbn` to its data block, or `None` where nothing is
    /// mapped yet.
    pub(crate) fn map_block(&self, fbn: usize) -> Result<Option<BlockNumber>> {
        if fbn < NDIRECT {
            let addr = self.cell.record.addrs[fbn];
            if addr == 0 {
                return Ok(None);
            }
            return Ok(Some(BlockNumber(u64::from(addr))));
        }

        let index = fbn - NDIRECT;
        if index >= NINDIRECT {
            return Ok(None);
        }
        let indirect = self.cell.record.addrs[NDIRECT];
        if indirect == 0 {
            return Ok(None);
        }
        let guard = self
            .fs
            .cache
            .acquire(self.fs.dev, BlockNumber(u64::from(indirect)))?;
        let addr = read_le_u32(guard.data(), index * 4).map_err(parse_err)?;
        if addr == 0 {
            return Ok(None);
        }
        Ok(Some(BlockNumber(u64::from(addr))))
    }

    /// Map file block `fbn`, allocating the data block (and the indirect
    /// block, first time past the direct range) as needed.
    pub(crate) fn ensure_block(&mut self, fbn: usize) -> Result<BlockNumber> {
        if fbn < NDIRECT {
            let addr = self.cell.record.addrs[fbn];
            if addr != 0 {
                return Ok(BlockNumber(u64::from(addr)));
            }
            let block = self.fs.balloc()?;
            self.cell.record.addrs[fbn] = block.to_u32().map_err(parse_err)?;
            return Ok(block);
        }

        let index = fbn - NDIRECT;
        if index >= NINDIRECT {
            return Err(DfsError::FileTooLarge {
                max_blocks: MAX_FILE_BLOCKS,
            });
        }

        let indirect = match self.cell.record.addrs[NDIRECT] {
            0 => {
                let block = self.fs.balloc()?;
                self.cell.record.addrs[NDIRECT] = block.to_u32().map_err(parse_err)?;
                block
            }
            addr => BlockNumber(u64::from(addr)),
        };

        let mut guard = self.fs.cache.acquire(self.fs.dev, indirect)?;
        let offset = index * 4;
        let addr = read_le_u32(guard.data(), offset).map_err(parse_err)?;
        if addr != 0 {
            return Ok(BlockNumber(u64::from(addr)));
        }
        let block = self.fs.balloc()?;
        write_le_u32(guard.data_mut(), offset, block.to_u32().map_err(parse_err)?)
            .map_err(parse_err)?;
        guard.mark_dirty()?;
        drop(guard);
        self.fs.log.record(self.fs.dev, indirect)?;
        Ok(block)
    }

    /// Read up to `buf.len()` bytes starting at `offset`, bounded by the
    /// inode's size. Returns the number of bytes read; zero once `offset`
    /// reaches the end.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = u64::from(self.cell.record.size);
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = size.min(offset.saturating_add(buf.len() as u64));

        let mut pos = offset;
        while pos < end {
            let fbn = (pos / SECTOR_SIZE as u64) as usize;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let count = (SECTOR_SIZE - within).min((end - pos) as usize);
            let start = (pos - offset) as usize;
            let dst = &mut buf[start..start + count];
            match self.map_block(fbn)? {
                Some(block) => {
                    let guard = self.fs.cache.acquire(self.fs.dev, block)?;
                    dst.copy_from_slice(&guard.data()[within..within + count]);
                }
                None => dst.fill(0),
            }
            pos += count as u64;
        }
        Ok((end - offset) as usize)
    }

    /// Write `data` at `offset`, extending the size when the write runs past
    /// the current end. The start may not skip past the end of the file, so
    /// content never has holes.
    ///
    /// Dirties the data blocks, the allocation metadata, and the inode table
    /// slot, all recorded into the running operation. The content checksum is
    /// restamped over the whole extent before the record is written back.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = u64::from(self.cell.record.size);
        if offset > size {
            return Err(DfsError::ContractViolation(format!(
                "write at {offset} starts past the end of inode {} (size {size})",
                self.inum
            )));
        }
        let Some(end) = offset.checked_add(data.len() as u64) else {
            return Err(DfsError::FileTooLarge {
                max_blocks: MAX_FILE_BLOCKS,
            });
        };
        if end > (MAX_FILE_BLOCKS * SECTOR_SIZE) as u64 {
            return Err(DfsError::FileTooLarge {
                max_blocks: MAX_FILE_BLOCKS,
            });
        }

        let mut pos = offset;
        while pos < end {
            let fbn = (pos / SECTOR_SIZE as u64) as usize;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let count = (SECTOR_SIZE - within).min((end - pos) as usize);
            let start = (pos - offset) as usize;
            let block = self.ensure_block(fbn)?;
            let mut guard = self.fs.cache.acquire(self.fs.dev, block)?;
            guard.data_mut()[within..within + count].copy_from_slice(&data[start..start + count]);
            guard.mark_dirty()?;
            drop(guard);
            self.fs.log.record(self.fs.dev, block)?;
            pos += count as u64;
        }

        if end > size {
            self.cell.record.size = end as u32;
        }
        self.cell.record.checksum = self.content_checksum()?;
        self.update()?;
        debug!(
            target: "dfs::fs",
            inode = %self.inum,
            offset,
            len = data.len(),
            "wrote content"
        );
        Ok(())
    }

    /// Free every content block and reset size and checksum to zero.
    pub fn truncate(&mut self) -> Result<()> {
        for i in 0..NDIRECT {
            let addr = self.cell.record.addrs[i];
            if addr != 0 {
                self.fs.bfree(BlockNumber(u64::from(addr)))?;
                self.cell.record.addrs[i] = 0;
            }
        }

        let indirect = self.cell.record.addrs[NDIRECT];
        if indirect != 0 {
            let indirect = BlockNumber(u64::from(indirect));
            let mut mapped = Vec::new();
            {
                let guard = self.fs.cache.acquire(self.fs.dev, indirect)?;
                for index in 0..NINDIRECT {
                    let addr = read_le_u32(guard.data(), index * 4).map_err(parse_err)?;
                    if addr != 0 {
                        mapped.push(BlockNumber(u64::from(addr)));
                    }
                }
            }
            for block in mapped {
                self.fs.bfree(block)?;
            }
            self.fs.bfree(indirect)?;
            self.cell.record.addrs[NDIRECT] = 0;
        }

        self.cell.record.size = 0;
        self.cell.record.checksum = 0;
        self.update()?;
        debug!(target: "dfs::fs", inode = %self.inum, "truncated");
        Ok(())
    }

    /// Fold the content into its checksum, window by window.
    pub fn content_checksum(&self) -> Result<u32> {
        let mut digest = ContentChecksum::new();
        let mut window = vec![0u8; CHECKSUM_WINDOW];
        let size = u64::from(self.cell.record.size);
        let mut offset = 0u64;
        while offset < size {
            let read = self.read_at(offset, &mut window)?;
            if read == 0 {
                break;
            }
            digest.fold(&window[..read]);
            offset += read as u64;
        }
        Ok(digest.finish())
    }

    /// Compare the stored checksum against a fresh fold of the content.
    pub fn verify(&self) -> Result<()> {
        let stored = self.cell.record.checksum;
        let computed = self.content_checksum()?;
        if stored == computed {
            return Ok(());
        }
        warn!(
            target: "dfs::fs",
            inode = %self.inum,
            stored,
            computed,
            "content checksum mismatch"
        );
        Err(DfsError::Corrupted {
            inode: u64::from(self.inum.0),
            stored,
            computed,
        })
    }
}
