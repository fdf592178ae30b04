#![forbid(unsafe_code)]

//! Simulated bit rot for disk images.
//!
//! The injector walks an allocated inode's content blocks through the same
//! direct/indirect map the checksum fold reads, and flips each content bit
//! independently with probability `1/flip_chance`. It operates on raw
//! sectors, bypassing the buffer cache's ownership protocol entirely, so it
//! must never run while cache-mediated access to the same image is live.
//! Every run produces a [`FlipReport`] with before/after content digests as
//! evidence, and the RNG is seeded so a scenario can be replayed exactly.

use blake3::Hasher;
use dfs_block::ByteDevice;
use dfs_error::{DfsError, Result};
use dfs_ondisk::{INODE_RECORD_SIZE, InodeRecord, InodeType, MAX_FILE_BLOCKS, NDIRECT, Superblock};
use dfs_types::{InodeNumber, SECTOR_SIZE, read_le_u32};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

/// Evidence from one injection run over one inode.
#[derive(Debug, Clone, Serialize)]
pub struct FlipReport {
    pub inode: u32,
    pub flip_chance: i64,
    pub bits_examined: u64,
    pub bits_flipped: u64,
    /// Block numbers that had at least one bit flipped and were written back.
    pub affected_blocks: Vec<u64>,
    /// Hex BLAKE3 of the content bytes before any flip.
    pub digest_before: String,
    /// Hex BLAKE3 of the content bytes after the run.
    pub digest_after: String,
}

/// Seedable bit-rot injector over a raw device image.
pub struct Injector<'a> {
    device: &'a dyn ByteDevice,
    sb: Superblock,
    rng: StdRng,
}

impl<'a> Injector<'a> {
    /// Open an image for injection, validating its superblock.
    pub fn open(device: &'a dyn ByteDevice, seed: u64) -> Result<Self> {
        let mut block = [0u8; SECTOR_SIZE];
        device.read_at(SECTOR_SIZE as u64, &mut block)?;
        let sb = Superblock::parse(&block).map_err(|err| DfsError::Format(err.to_string()))?;
        sb.validate()
            .map_err(|err| DfsError::InvalidGeometry(err.to_string()))?;
        Ok(Self {
            device,
            sb,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Flip each content bit of `inum` with probability `1/flip_chance`.
    ///
    /// A `flip_chance` of 1 flips every bit; zero or negative leaves the
    /// content untouched but still walks it, so the report's examined count
    /// and digests are produced either way. Modified blocks are written
    /// back in place.
    pub fn inject(&mut self, inum: InodeNumber, flip_chance: i64) -> Result<FlipReport> {
        let record = self.read_record(inum)?;
        if record.itype == InodeType::Free {
            return Err(DfsError::NotFound(format!("inode {inum} is not allocated")));
        }
        let map = self.content_blocks(inum, &record)?;

        let mut before = Hasher::new();
        let mut after = Hasher::new();
        let mut bits_examined = 0u64;
        let mut bits_flipped = 0u64;
        let mut affected = Vec::new();
        let mut remaining = record.size as usize;

        for &addr in &map {
            let offset = u64::from(addr) * SECTOR_SIZE as u64;
            let mut block = [0u8; SECTOR_SIZE];
            self.device.read_at(offset, &mut block)?;
            let take = remaining.min(SECTOR_SIZE);
            before.update(&block[..take]);

            let mut modified = false;
            for byte in block.iter_mut().take(take) {
                for bit in 0..8 {
                    bits_examined += 1;
                    if flip_chance > 0 && self.rng.gen_range(0..flip_chance) == 0 {
                        *byte ^= 1 << bit;
                        bits_flipped += 1;
                        modified = true;
                    }
                }
            }
            after.update(&block[..take]);

            if modified {
                self.device.write_at(offset, &block)?;
                affected.push(u64::from(addr));
            }
            remaining -= take;
        }

        info!(
            target: "dfs::inject",
            inode = %inum,
            flip_chance,
            bits_flipped,
            bits_examined,
            affected = affected.len(),
            "injected bit rot"
        );

        Ok(FlipReport {
            inode: inum.0,
            flip_chance,
            bits_examined,
            bits_flipped,
            affected_blocks: affected,
            digest_before: hex::encode(before.finalize().as_bytes()),
            digest_after: hex::encode(after.finalize().as_bytes()),
        })
    }

    fn read_record(&self, inum: InodeNumber) -> Result<InodeRecord> {
        if inum.0 == 0 || inum.0 >= self.sb.inode_count {
            return Err(DfsError::NotFound(format!("inode {inum} is out of range")));
        }
        let block = self.sb.inode_block(inum);
        let mut data = [0u8; SECTOR_SIZE];
        self.device.read_at(block.0 * SECTOR_SIZE as u64, &mut data)?;
        let offset = Superblock::inode_offset(inum);
        InodeRecord::parse(&data[offset..offset + INODE_RECORD_SIZE])
            .map_err(|err| DfsError::Format(err.to_string()))
    }

    /// Resolve the inode's content blocks in logical order, direct then
    /// indirect, bounded by its size.
    fn content_blocks(&self, inum: InodeNumber, record: &InodeRecord) -> Result<Vec<u32>> {
        let blocks_needed = (record.size as usize).div_ceil(SECTOR_SIZE);
        if blocks_needed > MAX_FILE_BLOCKS {
            return Err(DfsError::Format(format!(
                "inode {inum} claims {blocks_needed} blocks"
            )));
        }

        let mut map = Vec::with_capacity(blocks_needed);
        for fbn in 0..blocks_needed.min(NDIRECT) {
            map.push(record.addrs[fbn]);
        }
        if blocks_needed > NDIRECT {
            let ind = record.addrs[NDIRECT];
            if ind == 0 {
                return Err(DfsError::Format(format!(
                    "inode {inum} is missing its indirect block"
                )));
            }
            let mut table = [0u8; SECTOR_SIZE];
            self.device
                .read_at(u64::from(ind) * SECTOR_SIZE as u64, &mut table)?;
            for fbn in NDIRECT..blocks_needed {
                let addr = read_le_u32(&table, (fbn - NDIRECT) * 4)
                    .map_err(|err| DfsError::Format(err.to_string()))?;
                map.push(addr);
            }
        }

        if map.iter().any(|&addr| addr == 0) {
            return Err(DfsError::Format(format!(
                "inode {inum} has a hole in its block map"
            )));
        }
        Ok(map)
    }
}

impl std::fmt::Debug for Injector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("sb", &self.sb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dfs_block::{BufCache, MemByteDevice};
    use dfs_ditto::DittoManager;
    use dfs_fs::{Fs, FsOptions, mkfs};
    use dfs_types::DeviceId;

    const DEV: DeviceId = DeviceId(1);

    /// Build an image holding one file, then drop the mount so the injector
    /// has the raw device to itself.
    fn image_with(data: &[u8]) -> (Arc<MemByteDevice>, InodeNumber) {
        let device = Arc::new(MemByteDevice::new(512 * SECTOR_SIZE));
        mkfs(device.as_ref(), 512, 64, 12).expect("mkfs");
        let inum = {
            let cache = Arc::new(BufCache::new(16));
            let fs = Fs::mount(
                cache,
                DEV,
                Arc::clone(&device) as Arc<dyn ByteDevice>,
                FsOptions::default(),
            )
            .expect("mount");
            let mgr = DittoManager::new(Arc::new(fs));
            mgr.import("/victim", data).expect("import")
        };
        (device, inum)
    }

    fn remount(device: &Arc<MemByteDevice>) -> DittoManager {
        let cache = Arc::new(BufCache::new(16));
        let fs = Fs::mount(
            cache,
            DEV,
            Arc::clone(device) as Arc<dyn ByteDevice>,
            FsOptions::default(),
        )
        .expect("remount");
        DittoManager::new(Arc::new(fs))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[test]
    fn chance_one_flips_every_bit() {
        let data = pattern(3 * SECTOR_SIZE + 100);
        let (device, inum) = image_with(&data);

        let mut injector = Injector::open(device.as_ref(), 7).expect("open");
        let report = injector.inject(inum, 1).expect("inject");

        assert_eq!(report.inode, inum.0);
        assert_eq!(report.bits_examined, data.len() as u64 * 8);
        assert_eq!(report.bits_flipped, report.bits_examined);
        assert_eq!(report.affected_blocks.len(), 4);
        assert_eq!(
            report.digest_before,
            hex::encode(blake3::hash(&data).as_bytes())
        );
        assert_ne!(report.digest_before, report.digest_after);

        // Back through the stack: the verified open refuses, the forced open
        // serves every byte inverted.
        let mgr = remount(&device);
        let err = mgr.verify_inode(inum).unwrap_err();
        assert!(matches!(err, DfsError::Corrupted { .. }), "got {err:?}");
        let inverted: Vec<u8> = data.iter().map(|&b| !b).collect();
        assert_eq!(mgr.read_forced_inode(inum).expect("forced"), inverted);
    }

    #[test]
    fn non_positive_chance_only_observes() {
        let data = pattern(700);
        let (device, inum) = image_with(&data);
        let mut injector = Injector::open(device.as_ref(), 7).expect("open");

        for chance in [0, -5] {
            let report = injector.inject(inum, chance).expect("inject");
            assert_eq!(report.bits_examined, data.len() as u64 * 8);
            assert_eq!(report.bits_flipped, 0);
            assert!(report.affected_blocks.is_empty());
            assert_eq!(report.digest_before, report.digest_after);
        }

        remount(&device).verify_inode(inum).expect("still intact");
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let data = pattern(2 * SECTOR_SIZE);
        let (first_dev, first_inum) = image_with(&data);
        let (second_dev, second_inum) = image_with(&data);

        let first = Injector::open(first_dev.as_ref(), 42)
            .expect("open")
            .inject(first_inum, 8)
            .expect("inject");
        let second = Injector::open(second_dev.as_ref(), 42)
            .expect("open")
            .inject(second_inum, 8)
            .expect("inject");

        assert_eq!(first.bits_flipped, second.bits_flipped);
        assert_eq!(first.affected_blocks, second.affected_blocks);
        assert_eq!(first.digest_after, second.digest_after);

        let (third_dev, third_inum) = image_with(&data);
        let third = Injector::open(third_dev.as_ref(), 43)
            .expect("open")
            .inject(third_inum, 8)
            .expect("inject");
        assert_ne!(first.digest_after, third.digest_after);
    }

    #[test]
    fn free_and_out_of_range_inodes_are_not_found() {
        let (device, _) = image_with(b"content");
        let mut injector = Injector::open(device.as_ref(), 1).expect("open");

        for inum in [InodeNumber(0), InodeNumber(63), InodeNumber(500)] {
            let err = injector.inject(inum, 1).unwrap_err();
            assert!(matches!(err, DfsError::NotFound(_)), "got {err:?}");
        }
    }

    #[test]
    fn indirect_blocks_are_walked() {
        // Fifteen blocks reaches three entries into the indirect table.
        let data = pattern(15 * SECTOR_SIZE);
        let (device, inum) = image_with(&data);

        let mut injector = Injector::open(device.as_ref(), 9).expect("open");
        let report = injector.inject(inum, 1).expect("inject");

        assert_eq!(report.bits_examined, data.len() as u64 * 8);
        assert_eq!(report.affected_blocks.len(), 15);
        let inverted: Vec<u8> = data.iter().map(|&b| !b).collect();
        assert_eq!(
            remount(&device).read_forced_inode(inum).expect("forced"),
            inverted
        );
    }

    #[test]
    fn empty_content_reports_nothing() {
        let (device, inum) = image_with(b"");
        let mut injector = Injector::open(device.as_ref(), 3).expect("open");
        let report = injector.inject(inum, 1).expect("inject");

        assert_eq!(report.bits_examined, 0);
        assert_eq!(report.bits_flipped, 0);
        assert!(report.affected_blocks.is_empty());
        assert_eq!(report.digest_before, report.digest_after);
    }

    #[test]
    fn foreign_images_are_rejected() {
        let device = MemByteDevice::new(64 * SECTOR_SIZE);
        let err = Injector::open(&device, 0).unwrap_err();
        assert!(matches!(err, DfsError::Format(_)), "got {err:?}");
    }
}
