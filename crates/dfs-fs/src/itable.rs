//! In-memory inode table.
//!
//! [`Itable`] interns one [`Inode`] per inode number so every user of an
//! inode shares the same mutex. Locking an inode loads its on-disk record on
//! first use; the record then lives in memory and is written back with
//! [`InodeGuard::update`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dfs_error::{DfsError, Result};
use dfs_ondisk::{INODE_RECORD_SIZE, INODES_PER_BLOCK, InodeRecord, InodeType, Superblock};
use dfs_types::{BlockNumber, InodeNumber};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::{Fs, parse_err};

/// Interning map from inode number to its shared in-memory inode.
pub struct Itable {
    map: Mutex<HashMap<InodeNumber, Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Return the shared inode for `inum`, creating it on first reference.
    #[must_use]
    pub fn get(&self, inum: InodeNumber) -> Arc<Inode> {
        let mut map = self.map.lock();
        Arc::clone(map.entry(inum).or_insert_with(|| {
            Arc::new(Inode {
                inum,
                cell: Mutex::new(InodeCell {
                    loaded: false,
                    record: InodeRecord::empty(),
                }),
            })
        }))
    }

    /// Drop the interned entry so the next `get` reloads from disk.
    ///
    /// Called when an inode slot is recycled by allocation; a cached record
    /// from the slot's previous life must not survive the reuse.
    pub(crate) fn discard(&self, inum: InodeNumber) {
        self.map.lock().remove(&inum);
    }
}

impl fmt::Debug for Itable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Itable")
            .field("interned", &self.map.lock().len())
            .finish()
    }
}

/// One inode's in-memory state, shared through the [`Itable`].
pub struct Inode {
    inum: InodeNumber,
    cell: Mutex<InodeCell>,
}

pub(crate) struct InodeCell {
    loaded: bool,
    pub(crate) record: InodeRecord,
}

impl Inode {
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.inum
    }

    /// Lock the inode, loading its record from the inode table on first use.
    ///
    /// The returned guard gives exclusive access to the record and to the
    /// inode's content until dropped. Corruption is not checked here; verified
    /// opens layer a checksum comparison on top of this lock.
    pub fn lock<'a>(&'a self, fs: &'a Fs) -> Result<InodeGuard<'a>> {
        let mut cell = self.cell.lock();
        if !cell.loaded {
            cell.record = fs.read_record(self.inum)?;
            cell.loaded = true;
        }
        Ok(InodeGuard {
            fs,
            inum: self.inum,
            cell,
        })
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode").field("inum", &self.inum).finish()
    }
}

/// Exclusive access to a locked inode's record and content.
#[must_use = "dropping the guard unlocks the inode"]
pub struct InodeGuard<'a> {
    pub(crate) fs: &'a Fs,
    pub(crate) inum: InodeNumber,
    pub(crate) cell: MutexGuard<'a, InodeCell>,
}

impl InodeGuard<'_> {
    #[must_use]
    pub fn number(&self) -> InodeNumber {
        self.inum
    }

    #[must_use]
    pub fn record(&self) -> &InodeRecord {
        &self.cell.record
    }

    /// Mutable access to the in-memory record; changes are not durable until
    /// [`InodeGuard::update`] runs inside an open operation.
    #[must_use]
    pub fn record_mut(&mut self) -> &mut InodeRecord {
        &mut self.cell.record
    }

    /// Write the record back to its inode table slot.
    pub fn update(&mut self) -> Result<()> {
        let table_block = self.fs.sb.inode_block(self.inum);
        let offset = Superblock::inode_offset(self.inum);
        let mut guard = self.fs.cache.acquire(self.fs.dev, table_block)?;
        self.cell
            .record
            .encode_into(&mut guard.data_mut()[offset..offset + INODE_RECORD_SIZE])
            .map_err(parse_err)?;
        guard.mark_dirty()?;
        drop(guard);
        self.fs.log.record(self.fs.dev, table_block)
    }
}

impl fmt::Debug for InodeGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeGuard")
            .field("inum", &self.inum)
            .field("itype", &self.cell.record.itype)
            .finish_non_exhaustive()
    }
}

impl Fs {
    fn check_inum(&self, inum: InodeNumber) -> Result<()> {
        if inum.0 == 0 || inum.0 >= self.sb.inode_count {
            return Err(DfsError::NotFound(format!("inode {inum}")));
        }
        Ok(())
    }

    /// Read an inode record straight from its table slot, without locking.
    ///
    /// Tooling that inspects inodes by number uses this; normal operation
    /// goes through [`Inode::lock`].
    pub fn read_record(&self, inum: InodeNumber) -> Result<InodeRecord> {
        self.check_inum(inum)?;
        let guard = self.cache.acquire(self.dev, self.sb.inode_block(inum))?;
        let offset = Superblock::inode_offset(inum);
        InodeRecord::parse(&guard.data()[offset..offset + INODE_RECORD_SIZE])
            .map_err(|err| DfsError::Format(err.to_string()))
    }

    /// Claim a free inode table slot and stamp it with `itype`.
    ///
    /// The new record starts with zero links, size, and checksum; callers
    /// finish initialization under the inode lock. Runs inside an open
    /// operation.
    pub fn alloc_inode(&self, itype: InodeType) -> Result<InodeNumber> {
        if itype == InodeType::Free {
            return Err(DfsError::ContractViolation(
                "cannot allocate an inode as free".to_owned(),
            ));
        }

        for table_index in 0..self.sb.inode_table_blocks() {
            let block = BlockNumber(u64::from(self.sb.inode_start) + u64::from(table_index));
            let mut guard = self.cache.acquire(self.dev, block)?;
            for slot in 0..INODES_PER_BLOCK {
                let inum = table_index * INODES_PER_BLOCK as u32 + slot as u32;
                if inum == 0 {
                    continue;
                }
                if inum >= self.sb.inode_count {
                    break;
                }
                let offset = slot * INODE_RECORD_SIZE;
                let record = InodeRecord::parse(&guard.data()[offset..offset + INODE_RECORD_SIZE])
                    .map_err(|err| DfsError::Format(err.to_string()))?;
                if record.itype != InodeType::Free {
                    continue;
                }

                let mut fresh = InodeRecord::empty();
                fresh.itype = itype;
                fresh
                    .encode_into(&mut guard.data_mut()[offset..offset + INODE_RECORD_SIZE])
                    .map_err(parse_err)?;
                guard.mark_dirty()?;
                drop(guard);
                self.log.record(self.dev, block)?;
                self.itable.discard(InodeNumber(inum));
                debug!(
                    target: "dfs::fs",
                    inode = inum,
                    itype = %itype,
                    "allocated inode"
                );
                return Ok(InodeNumber(inum));
            }
        }
        Err(DfsError::NoSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DEV, scratch_fs};

    #[test]
    fn lock_loads_root_record() {
        let fs = scratch_fs(16);
        let root = fs.inode(InodeNumber::ROOT);
        let guard = root.lock(&fs).expect("lock root");
        assert_eq!(guard.record().itype, InodeType::Directory);
        assert_eq!(guard.record().nlink, 1);
        assert_eq!(guard.record().size, 32);
    }

    #[test]
    fn interning_returns_the_same_inode() {
        let fs = scratch_fs(16);
        let a = fs.inode(InodeNumber(5));
        let b = fs.inode(InodeNumber(5));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn update_persists_through_the_cache() {
        let fs = scratch_fs(16);
        let root = fs.inode(InodeNumber::ROOT);

        let op = fs.log().begin_op();
        {
            let mut guard = root.lock(&fs).expect("lock root");
            guard.record_mut().major = 7;
            guard.update().expect("update");
        }
        op.end().expect("end op");

        // A fresh read of the table slot sees the new field.
        let record = fs.read_record(InodeNumber::ROOT).expect("read record");
        assert_eq!(record.major, 7);
    }

    #[test]
    fn alloc_inode_claims_distinct_slots() {
        let fs = scratch_fs(16);
        let op = fs.log().begin_op();
        let a = fs.alloc_inode(InodeType::File).expect("alloc a");
        let b = fs.alloc_inode(InodeType::DittoReplica).expect("alloc b");
        op.end().expect("end op");

        assert_ne!(a, b);
        assert_eq!(fs.read_record(a).expect("record a").itype, InodeType::File);
        assert_eq!(
            fs.read_record(b).expect("record b").itype,
            InodeType::DittoReplica
        );
    }

    #[test]
    fn alloc_inode_runs_out() {
        let fs = scratch_fs(16);
        let op = fs.log().begin_op();
        // Inode 0 is reserved and inode 1 is the root, so inode_count - 2
        // slots remain.
        let free_slots = fs.superblock().inode_count - 2;
        for _ in 0..free_slots {
            fs.alloc_inode(InodeType::File).expect("alloc");
        }
        let err = fs.alloc_inode(InodeType::File).unwrap_err();
        assert!(matches!(err, DfsError::NoSpace), "got {err:?}");
        op.end().expect("end op");
    }

    #[test]
    fn alloc_rejects_free_type() {
        let fs = scratch_fs(16);
        let op = fs.log().begin_op();
        let err = fs.alloc_inode(InodeType::Free).unwrap_err();
        assert!(matches!(err, DfsError::ContractViolation(_)), "got {err:?}");
        op.end().expect("end op");
    }

    #[test]
    fn read_record_rejects_out_of_range() {
        let fs = scratch_fs(16);
        assert!(matches!(
            fs.read_record(InodeNumber(0)),
            Err(DfsError::NotFound(_))
        ));
        let past_end = InodeNumber(fs.superblock().inode_count);
        assert!(matches!(
            fs.read_record(past_end),
            Err(DfsError::NotFound(_))
        ));
    }

    #[test]
    fn reserved_tail_stays_zero_after_update() {
        let fs = scratch_fs(16);
        let root = fs.inode(InodeNumber::ROOT);

        let op = fs.log().begin_op();
        {
            let mut guard = root.lock(&fs).expect("lock root");
            guard.record_mut().minor = 3;
            guard.update().expect("update");
        }
        op.end().expect("end op");

        let table_block = fs.superblock().inode_block(InodeNumber::ROOT);
        let guard = fs.cache().acquire(DEV, table_block).expect("acquire");
        let offset = Superblock::inode_offset(InodeNumber::ROOT);
        let slot = &guard.data()[offset..offset + INODE_RECORD_SIZE];
        assert!(slot[76..].iter().all(|&b| b == 0), "reserved tail dirtied");
    }
}
