//! The replication manager.
//!
//! Wraps a mounted [`Fs`] with the ditto operations: verified and forced
//! reads, explicit replication, rescue, and the namespace wrappers that keep
//! directory replicas fresh. Primaries point at their replicas through the
//! record's two child slots; replicas are nameless inodes of type
//! [`InodeType::DittoReplica`] reachable only through those slots.

use std::sync::Arc;

use dfs_error::{DfsError, Result};
use dfs_fs::{FILE_WRITE_CHUNK, Fs};
use dfs_ondisk::InodeType;
use dfs_types::InodeNumber;
use tracing::{info, warn};

use crate::propagate::Propagation;

/// Replica slots per inode.
pub const REPLICA_SLOTS: usize = 2;

/// Operational surface of the replication layer.
#[derive(Debug)]
pub struct DittoManager {
    fs: Arc<Fs>,
}

impl DittoManager {
    #[must_use]
    pub fn new(fs: Arc<Fs>) -> Self {
        Self { fs }
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    /// Verify `path`'s content against its stored checksum. Returns the
    /// checksum on success; a mismatch comes back as
    /// [`DfsError::Corrupted`] with both values.
    pub fn verify(&self, path: &str) -> Result<u32> {
        let inum = self.fs.resolve(path)?;
        self.verify_inode(inum)
    }

    /// Verify an inode by number, replicas included.
    pub fn verify_inode(&self, inum: InodeNumber) -> Result<u32> {
        let node = self.fs.inode(inum);
        let guard = node.lock(&self.fs)?;
        guard.verify()?;
        Ok(guard.record().checksum)
    }

    /// Read the whole content after a verified open.
    pub fn read_verified(&self, path: &str) -> Result<Vec<u8>> {
        self.read_verified_inode(self.fs.resolve(path)?)
    }

    /// Read the whole content without the checksum gate.
    ///
    /// The fold still runs so damage can be logged, but the content is
    /// served regardless. This is the door rescue walks through.
    pub fn read_forced(&self, path: &str) -> Result<Vec<u8>> {
        self.read_forced_inode(self.fs.resolve(path)?)
    }

    /// Verified open by inode number. Reaches replicas, which have no path.
    pub fn read_verified_inode(&self, inum: InodeNumber) -> Result<Vec<u8>> {
        self.read_inode(inum, true)
    }

    /// Forced open by inode number.
    pub fn read_forced_inode(&self, inum: InodeNumber) -> Result<Vec<u8>> {
        self.read_inode(inum, false)
    }

    fn read_inode(&self, inum: InodeNumber, verified: bool) -> Result<Vec<u8>> {
        let node = self.fs.inode(inum);
        let guard = node.lock(&self.fs)?;
        if guard.record().itype == InodeType::Directory {
            return Err(DfsError::IsDirectory);
        }

        if verified {
            guard.verify()?;
        } else if guard.verify().is_err() {
            warn!(
                target: "dfs::ditto",
                inode = %inum,
                "forced read of corrupted content"
            );
        }

        let mut buf = vec![0u8; guard.record().size as usize];
        let read = guard.read_at(0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Create `count` replicas of `path`'s inode and hang them off its free
    /// child slots.
    ///
    /// The source must verify first — damage is never replicated. Slots are
    /// checked before anything is allocated, each replica's content is
    /// propagated chunk by chunk, and only then does a final transaction
    /// persist the primary's new child pointers.
    pub fn duplicate(&self, path: &str, count: u8) -> Result<Vec<InodeNumber>> {
        if count == 0 || count as usize > REPLICA_SLOTS {
            return Err(DfsError::ContractViolation(format!(
                "replica count must be 1 or 2, got {count}"
            )));
        }

        let target = self.fs.resolve(path)?;
        let node = self.fs.inode(target);
        let guard = node.lock(&self.fs)?;
        if !matches!(
            guard.record().itype,
            InodeType::File | InodeType::Directory
        ) {
            return Err(DfsError::ContractViolation(format!(
                "cannot replicate an inode of type {}",
                guard.record().itype
            )));
        }
        guard.verify()?;

        let children = guard.record().children();
        drop(guard);

        let free: Vec<usize> = (0..REPLICA_SLOTS).filter(|&s| children[s] == 0).collect();
        if free.len() < usize::from(count) {
            let occupied = (0..REPLICA_SLOTS)
                .find(|&s| children[s] != 0)
                .unwrap_or(0);
            return Err(DfsError::ReplicaSlotOccupied {
                inode: u64::from(target.0),
                slot: occupied as u8,
            });
        }

        let mut placed: Vec<(usize, InodeNumber)> = Vec::new();
        for &slot in free.iter().take(usize::from(count)) {
            let op = self.fs.log().begin_op();
            let replica = self.fs.alloc_inode(InodeType::DittoReplica)?;
            {
                let rnode = self.fs.inode(replica);
                let mut rguard = rnode.lock(&self.fs)?;
                rguard.record_mut().nlink = 1;
                rguard.update()?;
            }
            op.end()?;

            Propagation::new(&self.fs, target, replica)?.run()?;
            placed.push((slot, replica));
        }

        // Child pointers land last: a crash mid-propagation leaks nameless
        // replicas instead of publishing half-copied ones.
        let op = self.fs.log().begin_op();
        {
            let mut guard = node.lock(&self.fs)?;
            for &(slot, replica) in &placed {
                match slot {
                    0 => guard.record_mut().child1 = replica.0,
                    _ => guard.record_mut().child2 = replica.0,
                }
            }
            guard.update()?;
        }
        op.end()?;

        info!(
            target: "dfs::ditto",
            path,
            inode = %target,
            replicas = placed.len(),
            "replicated content"
        );
        Ok(placed.into_iter().map(|(_, replica)| replica).collect())
    }

    /// Copy the replica in `slot` back over `path`'s primary content.
    ///
    /// The replica itself must verify; rescuing from a damaged replica would
    /// just relocate the damage. The primary's stored checksum is restamped
    /// by the copy, so a verified open succeeds afterwards.
    pub fn rescue(&self, path: &str, slot: u8) -> Result<()> {
        self.rescue_inode(self.fs.resolve(path)?, slot)
    }

    /// [`rescue`](Self::rescue) by inode number.
    pub fn rescue_inode(&self, target: InodeNumber, slot: u8) -> Result<()> {
        let node = self.fs.inode(target);
        let guard = node.lock(&self.fs)?;
        let children = guard.record().children();
        drop(guard);

        let Some(&raw) = children.get(usize::from(slot)) else {
            return Err(DfsError::ContractViolation(format!(
                "replica slot must be 0 or 1, got {slot}"
            )));
        };
        if raw == 0 {
            return Err(DfsError::NotFound(format!(
                "inode {target} has no replica in slot {slot}"
            )));
        }
        let replica = InodeNumber(raw);

        self.verify_inode(replica)?;
        Propagation::new(&self.fs, replica, target)?.run()?;
        self.verify_inode(target)?;

        info!(
            target: "dfs::ditto",
            inode = %target,
            replica = %replica,
            slot,
            "rescued content from replica"
        );
        Ok(())
    }

    /// Re-propagate `inum`'s content into each of its replicas. Returns how
    /// many replicas were freshened.
    pub fn refresh(&self, inum: InodeNumber) -> Result<usize> {
        let node = self.fs.inode(inum);
        let guard = node.lock(&self.fs)?;
        let children = guard.record().children();
        drop(guard);

        let mut refreshed = 0;
        for raw in children {
            if raw != 0 {
                Propagation::new(&self.fs, inum, InodeNumber(raw))?.run()?;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    /// Create a directory and freshen every replica the change touched: the
    /// new directory's own placed replicas and the parent's.
    pub fn mkdir(&self, path: &str) -> Result<InodeNumber> {
        let op = self.fs.log().begin_op();
        let inum = self.fs.mkdir(path)?;
        op.end()?;

        self.refresh(inum)?;
        let (parent, _) = self.fs.resolve_parent(path)?;
        self.refresh(parent)?;
        Ok(inum)
    }

    /// Create an empty file and freshen the parent directory's replicas.
    pub fn create_file(&self, path: &str) -> Result<InodeNumber> {
        let op = self.fs.log().begin_op();
        let inum = self.fs.create_file(path)?;
        op.end()?;

        let (parent, _) = self.fs.resolve_parent(path)?;
        self.refresh(parent)?;
        Ok(inum)
    }

    /// Write `data` into an existing inode from offset zero, one
    /// transaction per chunk.
    pub fn write_file(&self, inum: InodeNumber, data: &[u8]) -> Result<()> {
        let mut offset = 0u64;
        for chunk in data.chunks(FILE_WRITE_CHUNK) {
            let op = self.fs.log().begin_op();
            {
                let node = self.fs.inode(inum);
                let mut guard = node.lock(&self.fs)?;
                guard.write_at(offset, chunk)?;
            }
            op.end()?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// Create a file at `path` holding `data`: the import path behind `put`.
    pub fn import(&self, path: &str, data: &[u8]) -> Result<InodeNumber> {
        let inum = self.create_file(path)?;
        self.write_file(inum, data)?;
        info!(
            target: "dfs::ditto",
            path,
            inode = %inum,
            len = data.len(),
            "imported file"
        );
        Ok(inum)
    }
}
