#![forbid(unsafe_code)]
//! DittoFS filesystem layer.
//!
//! Builds the inode-and-directory view on top of the buffer cache and the
//! transaction log:
//!
//! - [`itable`]: in-memory inode interning, locking, and the on-disk inode
//!   table (allocation, load, write-back).
//! - [`file`]: block allocation, file-block mapping, content reads and
//!   writes, truncation, and content checksums.
//! - [`dir`]: directory entries, path resolution, and `create`/`mkdir`
//!   with tiered replica placement for directories.
//!
//! # Locking and transactions
//!
//! Every inode is guarded by its own mutex; [`Inode::lock`] yields an
//! [`InodeGuard`] that owns the in-memory record until dropped. Locks are
//! always taken parent before child, and path walks hold a single lock at a
//! time, so the only multi-lock window is `create` holding a parent and a
//! freshly allocated child.
//!
//! Mutating operations record every block they dirty into the transaction
//! log, so callers must hold an open [`dfs_journal::OpGuard`] around each
//! mutation (`begin_op` .. `end_op`). Read paths never touch the log.

use std::fmt;
use std::sync::Arc;

use dfs_block::{BufCache, ByteDevice, DEFAULT_CAPACITY};
use dfs_error::{DfsError, Result};
use dfs_journal::{LogHeader, MAX_OP_BLOCKS, TxnLog, replay};
use dfs_ondisk::{
    BITS_PER_BITMAP_BLOCK, ContentChecksum, DIRENT_SIZE, INODE_RECORD_SIZE, InodeRecord,
    InodeType, Superblock, bitmap_set, encode_dirent,
};
use dfs_types::{DeviceId, InodeNumber, ParseError, SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod dir;
pub mod file;
pub mod itable;

pub use itable::{Inode, InodeGuard, Itable};

/// Default image size for `mkfs`, in blocks.
pub const DEFAULT_TOTAL_BLOCKS: u32 = 2048;
/// Default inode table population for `mkfs`.
pub const DEFAULT_INODE_COUNT: u32 = 200;
/// Default log region size for `mkfs`, in blocks (header + 29 slots).
pub const DEFAULT_LOG_BLOCKS: u32 = 30;

/// Largest content write a single transaction may carry, in bytes.
///
/// A write dirties its data blocks plus the inode table block, the indirect
/// block, and up to two partially covered blocks of slop, all of which must
/// fit in one operation's [`MAX_OP_BLOCKS`] budget. Long writes are split
/// into chunks of this size, one operation each.
pub const FILE_WRITE_CHUNK: usize = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * SECTOR_SIZE;

pub(crate) fn parse_err(err: ParseError) -> DfsError {
    DfsError::Parse(err.to_string())
}

/// Replica placement thresholds for new directories.
///
/// A directory created at depth `d` from the root receives two replicas when
/// `d < lower`, one when `lower <= d < higher`, and none once `d >= higher`.
/// The root itself sits at depth zero and is made by `mkfs`, which places no
/// replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DittoPolicy {
    pub lower: u32,
    pub higher: u32,
}

impl Default for DittoPolicy {
    fn default() -> Self {
        Self { lower: 2, higher: 4 }
    }
}

impl DittoPolicy {
    /// Replica count for a directory whose parent sits `depth` hops from root.
    #[must_use]
    pub fn replicas_for_depth(&self, depth: u32) -> u8 {
        if depth < self.lower {
            2
        } else if depth < self.higher {
            1
        } else {
            0
        }
    }
}

/// Mount-time configuration, JSON-loadable by the CLI and harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Buffer pool size handed to [`BufCache::new`] by the caller.
    pub cache_capacity: usize,
    pub ditto: DittoPolicy,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CAPACITY,
            ditto: DittoPolicy::default(),
        }
    }
}

/// A mounted filesystem on one device.
pub struct Fs {
    pub(crate) cache: Arc<BufCache>,
    pub(crate) log: TxnLog,
    pub(crate) sb: Superblock,
    pub(crate) dev: DeviceId,
    pub(crate) itable: Itable,
    pub(crate) options: FsOptions,
}

impl Fs {
    /// Mount the image on `device`, registering it with the cache under
    /// `dev`, replaying any committed-but-uninstalled transaction group, and
    /// binding the log.
    pub fn mount(
        cache: Arc<BufCache>,
        dev: DeviceId,
        device: Arc<dyn ByteDevice>,
        options: FsOptions,
    ) -> Result<Self> {
        if options.ditto.lower >= options.ditto.higher {
            return Err(DfsError::ContractViolation(format!(
                "ditto thresholds must satisfy lower < higher, got {} >= {}",
                options.ditto.lower, options.ditto.higher
            )));
        }

        cache.register(dev, Arc::clone(&device))?;

        let mut block = [0u8; SECTOR_SIZE];
        device.read_at(SECTOR_SIZE as u64, &mut block)?;
        let sb = Superblock::parse(&block).map_err(|err| DfsError::Format(err.to_string()))?;
        sb.validate()
            .map_err(|err| DfsError::InvalidGeometry(err.to_string()))?;

        let image_bytes = u64::from(sb.total_blocks) * SECTOR_SIZE as u64;
        if device.len() < image_bytes {
            return Err(DfsError::InvalidGeometry(format!(
                "device holds {} bytes, superblock describes {image_bytes}",
                device.len()
            )));
        }

        let replayed = replay(device.as_ref(), &sb)?;
        let log = TxnLog::new(Arc::clone(&cache), dev, &sb)?;

        info!(
            target: "dfs::fs",
            device = %dev,
            total_blocks = sb.total_blocks,
            inode_count = sb.inode_count,
            log_blocks = sb.log_blocks,
            replayed,
            "mounted filesystem"
        );

        Ok(Self {
            cache,
            log,
            sb,
            dev,
            itable: Itable::new(),
            options,
        })
    }

    /// The parsed superblock of the mounted image.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// The transaction log; callers open operations through it.
    #[must_use]
    pub fn log(&self) -> &TxnLog {
        &self.log
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufCache> {
        &self.cache
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.dev
    }

    #[must_use]
    pub fn options(&self) -> &FsOptions {
        &self.options
    }

    /// Intern `inum` and return its shared in-memory inode.
    #[must_use]
    pub fn inode(&self, inum: InodeNumber) -> Arc<Inode> {
        self.itable.get(inum)
    }
}

impl fmt::Debug for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fs")
            .field("dev", &self.dev)
            .field("total_blocks", &self.sb.total_blocks)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Format `device` with a fresh image: zeroed blocks, superblock, a root
/// directory holding `.` and `..`, the allocation bitmap, and an empty,
/// checksummed log header.
///
/// The root directory is inode 1 with `nlink` 1 and no replicas; every other
/// inode starts free. Returns the superblock it wrote.
pub fn mkfs(
    device: &dyn ByteDevice,
    total_blocks: u32,
    inode_count: u32,
    log_blocks: u32,
) -> Result<Superblock> {
    let sb = Superblock::compute(total_blocks, inode_count, log_blocks)
        .map_err(|err| DfsError::InvalidGeometry(err.to_string()))?;

    let image_bytes = u64::from(total_blocks) * SECTOR_SIZE as u64;
    if device.len() < image_bytes {
        return Err(DfsError::InvalidGeometry(format!(
            "device holds {} bytes, image needs {image_bytes}",
            device.len()
        )));
    }

    let zeroes = [0u8; SECTOR_SIZE];
    for block in 0..u64::from(total_blocks) {
        device.write_at(block * SECTOR_SIZE as u64, &zeroes)?;
    }

    // Root directory content: `.` and `..` both point back at the root.
    let mut root_block = [0u8; SECTOR_SIZE];
    encode_dirent(&mut root_block, 0, InodeNumber::ROOT, ".").map_err(parse_err)?;
    encode_dirent(&mut root_block, 1, InodeNumber::ROOT, "..").map_err(parse_err)?;
    let root_size = (2 * DIRENT_SIZE) as u32;
    let root_dir_block = u64::from(sb.data_start);
    device.write_at(root_dir_block * SECTOR_SIZE as u64, &root_block)?;

    let mut digest = ContentChecksum::new();
    digest.fold(&root_block[..root_size as usize]);

    let mut root = InodeRecord::empty();
    root.itype = InodeType::Directory;
    root.nlink = 1;
    root.size = root_size;
    root.addrs[0] = sb.data_start;
    root.checksum = digest.finish();

    let table_block = sb.inode_block(InodeNumber::ROOT);
    let mut table = [0u8; SECTOR_SIZE];
    let offset = Superblock::inode_offset(InodeNumber::ROOT);
    root.encode_into(&mut table[offset..offset + INODE_RECORD_SIZE])
        .map_err(parse_err)?;
    device.write_at(table_block.0 * SECTOR_SIZE as u64, &table)?;

    // Bitmap: metadata through the root directory block is used, as is the
    // log region. Everything between is free data space.
    let total = u64::from(total_blocks);
    let data_start = u64::from(sb.data_start);
    let log_start = u64::from(sb.log_start);
    for index in 0..sb.bitmap_blocks() {
        let mut map = [0u8; SECTOR_SIZE];
        let base = u64::from(index) * BITS_PER_BITMAP_BLOCK as u64;
        for bit in 0..BITS_PER_BITMAP_BLOCK {
            let block = base + bit as u64;
            if block >= total {
                break;
            }
            if block <= data_start || block >= log_start {
                bitmap_set(&mut map, bit).map_err(parse_err)?;
            }
        }
        let map_block = u64::from(sb.bitmap_start) + u64::from(index);
        device.write_at(map_block * SECTOR_SIZE as u64, &map)?;
    }

    // A stamped empty log header, so the first mount sees a clean log rather
    // than a checksum mismatch over raw zeroes.
    let mut header = [0u8; SECTOR_SIZE];
    LogHeader::empty().encode_into(&mut header).map_err(parse_err)?;
    device.write_at(log_start * SECTOR_SIZE as u64, &header)?;

    let mut super_block = [0u8; SECTOR_SIZE];
    sb.encode_into(&mut super_block).map_err(parse_err)?;
    device.write_at(SECTOR_SIZE as u64, &super_block)?;

    info!(
        target: "dfs::fs",
        total_blocks,
        inode_count,
        log_blocks,
        data_start = sb.data_start,
        log_start = sb.log_start,
        "formatted image"
    );

    Ok(sb)
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;

    use dfs_block::{BufCache, MemByteDevice};
    use dfs_types::{DeviceId, InodeNumber, SECTOR_SIZE};

    use crate::{FILE_WRITE_CHUNK, Fs, FsOptions, mkfs};

    pub(crate) const DEV: DeviceId = DeviceId(1);

    /// A freshly formatted in-memory image: 256 blocks, 32 inodes, a
    /// 12-block log, mounted on a pool of `capacity` buffers.
    pub(crate) fn scratch_fs(capacity: usize) -> Fs {
        let device = Arc::new(MemByteDevice::new(256 * SECTOR_SIZE));
        mkfs(device.as_ref(), 256, 32, 12).expect("mkfs");
        let cache = Arc::new(BufCache::new(capacity));
        Fs::mount(cache, DEV, device, FsOptions::default()).expect("mount")
    }

    /// Write `data` through the inode in log-sized chunks, one operation per
    /// chunk, the way long writes are driven in production.
    pub(crate) fn write_all(fs: &Fs, inum: InodeNumber, mut offset: u64, data: &[u8]) {
        for chunk in data.chunks(FILE_WRITE_CHUNK) {
            let op = fs.log().begin_op();
            let inode = fs.inode(inum);
            let mut guard = inode.lock(fs).expect("lock inode");
            guard.write_at(offset, chunk).expect("write chunk");
            drop(guard);
            op.end().expect("end op");
            offset += chunk.len() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DEV, scratch_fs};
    use dfs_block::MemByteDevice;
    use dfs_ondisk::bitmap_get;
    use dfs_types::BlockNumber;

    #[test]
    fn mkfs_lays_out_the_default_geometry() {
        let device = MemByteDevice::new(2048 * SECTOR_SIZE);
        let sb = mkfs(
            &device,
            DEFAULT_TOTAL_BLOCKS,
            DEFAULT_INODE_COUNT,
            DEFAULT_LOG_BLOCKS,
        )
        .expect("mkfs");

        assert_eq!(sb.inode_start, 2);
        assert_eq!(sb.bitmap_start, 52);
        assert_eq!(sb.data_start, 53);
        assert_eq!(sb.log_start, 2018);
        assert_eq!(sb.data_blocks, 2018 - 53);
    }

    #[test]
    fn mkfs_marks_metadata_and_log_as_used() {
        let device = MemByteDevice::new(256 * SECTOR_SIZE);
        let sb = mkfs(&device, 256, 32, 12).expect("mkfs");

        let mut map = [0u8; SECTOR_SIZE];
        device
            .read_at(u64::from(sb.bitmap_start) * SECTOR_SIZE as u64, &mut map)
            .expect("read bitmap");

        // Metadata through the root directory block is used.
        for block in 0..=u64::from(sb.data_start) {
            let bit = Superblock::bitmap_bit_for(BlockNumber(block));
            assert!(bitmap_get(&map, bit).expect("get"), "block {block} free");
        }
        // The first free data block sits right after the root directory.
        let first_free = Superblock::bitmap_bit_for(BlockNumber(u64::from(sb.data_start) + 1));
        assert!(!bitmap_get(&map, first_free).expect("get"));
        // The log region is used through the end of the image.
        for block in u64::from(sb.log_start)..u64::from(sb.total_blocks) {
            let bit = Superblock::bitmap_bit_for(BlockNumber(block));
            assert!(bitmap_get(&map, bit).expect("get"), "log block {block} free");
        }
    }

    #[test]
    fn mkfs_rejects_a_short_device() {
        let device = MemByteDevice::new(100 * SECTOR_SIZE);
        let err = mkfs(&device, 256, 32, 12).unwrap_err();
        assert!(matches!(err, DfsError::InvalidGeometry(_)), "got {err:?}");
    }

    #[test]
    fn mount_round_trips_a_fresh_image() {
        let fs = scratch_fs(8);
        assert_eq!(fs.superblock().total_blocks, 256);
        assert_eq!(fs.device_id(), DEV);

        let root = fs.read_record(InodeNumber::ROOT).expect("root record");
        assert_eq!(root.itype, InodeType::Directory);
        assert_eq!(root.nlink, 1);
        assert_eq!(root.size, 32);

        // mkfs stamped the root content checksum, so the first verified walk
        // passes without any write having happened.
        assert_eq!(fs.resolve("/").expect("resolve"), InodeNumber::ROOT);
    }

    #[test]
    fn mount_rejects_a_foreign_image() {
        let device = Arc::new(MemByteDevice::new(256 * SECTOR_SIZE));
        let cache = Arc::new(BufCache::new(8));
        let err = Fs::mount(cache, DEV, device, FsOptions::default()).unwrap_err();
        assert!(matches!(err, DfsError::Format(_)), "got {err:?}");
    }

    #[test]
    fn mount_rejects_inverted_ditto_thresholds() {
        let device = Arc::new(MemByteDevice::new(256 * SECTOR_SIZE));
        mkfs(device.as_ref(), 256, 32, 12).expect("mkfs");
        let cache = Arc::new(BufCache::new(8));
        let options = FsOptions {
            ditto: DittoPolicy { lower: 4, higher: 2 },
            ..FsOptions::default()
        };
        let err = Fs::mount(cache, DEV, device, options).unwrap_err();
        assert!(matches!(err, DfsError::ContractViolation(_)), "got {err:?}");
    }

    #[test]
    fn replica_ladder_from_thresholds() {
        let policy = DittoPolicy::default();
        assert_eq!(policy.replicas_for_depth(0), 2);
        assert_eq!(policy.replicas_for_depth(1), 2);
        assert_eq!(policy.replicas_for_depth(2), 1);
        assert_eq!(policy.replicas_for_depth(3), 1);
        assert_eq!(policy.replicas_for_depth(4), 0);
        assert_eq!(policy.replicas_for_depth(100), 0);
    }

    #[test]
    fn options_load_from_partial_json() {
        let options: FsOptions = serde_json::from_str("{}").expect("empty object");
        assert_eq!(options, FsOptions::default());

        let options: FsOptions =
            serde_json::from_str(r#"{"cache_capacity": 8}"#).expect("partial");
        assert_eq!(options.cache_capacity, 8);
        assert_eq!(options.ditto, DittoPolicy::default());

        let options: FsOptions =
            serde_json::from_str(r#"{"ditto": {"lower": 1, "higher": 3}}"#).expect("nested");
        assert_eq!(options.ditto.lower, 1);
        assert_eq!(options.ditto.higher, 3);
    }

    #[test]
    fn file_write_chunk_fits_the_operation_budget() {
        // Data blocks per chunk, plus inode table, indirect, and two blocks
        // of slop for unaligned starts, stays within one operation.
        assert_eq!(FILE_WRITE_CHUNK % SECTOR_SIZE, 0);
        assert!(FILE_WRITE_CHUNK / SECTOR_SIZE + 4 <= MAX_OP_BLOCKS);
    }
}

