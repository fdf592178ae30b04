//! Directories, path resolution, and creation.
//!
//! Directory content is an array of 16-byte entries; a zero inode number
//! marks a free slot. Path walks are absolute, lock one directory at a time,
//! and verify each directory they read through, so a damaged directory
//! surfaces as [`DfsError::Corrupted`] instead of a silent misresolution.
//!
//! `create` places ditto replicas for new directories: the parent's distance
//! from the root picks the replica count, and the replica inodes are
//! allocated up front with empty content. Content flows into them later,
//! when the replication layer propagates.

use dfs_error::{DfsError, Result};
use dfs_ondisk::{
    DIRENT_SIZE, DIR_NAME_LEN, Dirent, InodeType, encode_dirent, parse_dirent, validate_name,
};
use dfs_types::{InodeNumber, SECTOR_SIZE};
use tracing::{debug, info};

use crate::itable::InodeGuard;
use crate::{Fs, parse_err};

impl InodeGuard<'_> {
    /// Find `name` in this directory.
    pub fn lookup(&self, name: &str) -> Result<Option<InodeNumber>> {
        if self.cell.record.itype != InodeType::Directory {
            return Err(DfsError::NotDirectory);
        }
        let size = self.cell.record.size as usize;
        let mut block = [0u8; SECTOR_SIZE];
        let mut offset = 0usize;
        while offset < size {
            let read = self.read_at(offset as u64, &mut block)?;
            if read == 0 {
                break;
            }
            for slot in 0..read / DIRENT_SIZE {
                let entry = parse_dirent(&block, slot).map_err(parse_err)?;
                if entry.inum.0 != 0 && entry.name == name {
                    return Ok(Some(entry.inum));
                }
            }
            offset += read;
        }
        Ok(None)
    }

    /// Every live entry, in slot order. Includes `.` and `..`.
    pub fn entries(&self) -> Result<Vec<Dirent>> {
        if self.cell.record.itype != InodeType::Directory {
            return Err(DfsError::NotDirectory);
        }
        let size = self.cell.record.size as usize;
        let mut found = Vec::new();
        let mut block = [0u8; SECTOR_SIZE];
        let mut offset = 0usize;
        while offset < size {
            let read = self.read_at(offset as u64, &mut block)?;
            if read == 0 {
                break;
            }
            for slot in 0..read / DIRENT_SIZE {
                let entry = parse_dirent(&block, slot).map_err(parse_err)?;
                if entry.inum.0 != 0 {
                    found.push(entry);
                }
            }
            offset += read;
        }
        Ok(found)
    }

    /// Byte offset of the first free slot, if any slot has been vacated.
    fn free_slot(&self) -> Result<Option<u64>> {
        let size = self.cell.record.size as usize;
        let mut block = [0u8; SECTOR_SIZE];
        let mut offset = 0usize;
        while offset < size {
            let read = self.read_at(offset as u64, &mut block)?;
            if read == 0 {
                break;
            }
            for slot in 0..read / DIRENT_SIZE {
                let entry = parse_dirent(&block, slot).map_err(parse_err)?;
                if entry.inum.0 == 0 {
                    return Ok(Some((offset + slot * DIRENT_SIZE) as u64));
                }
            }
            offset += read;
        }
        Ok(None)
    }

    /// Add a `name -> inum` entry, reusing a free slot or growing the
    /// directory. Runs inside an open operation; link counts are the
    /// caller's business.
    pub fn link(&mut self, name: &str, inum: InodeNumber) -> Result<()> {
        if self.cell.record.itype != InodeType::Directory {
            return Err(DfsError::NotDirectory);
        }
        if name.len() > DIR_NAME_LEN {
            return Err(DfsError::NameTooLong);
        }
        validate_name(name).map_err(parse_err)?;
        if self.lookup(name)?.is_some() {
            return Err(DfsError::Exists);
        }

        let offset = self
            .free_slot()?
            .unwrap_or_else(|| u64::from(self.cell.record.size));
        let mut entry = [0u8; DIRENT_SIZE];
        encode_dirent(&mut entry, 0, inum, name).map_err(parse_err)?;
        self.write_at(offset, &entry)?;
        debug!(
            target: "dfs::fs",
            dir = %self.inum,
            name,
            inode = %inum,
            "linked entry"
        );
        Ok(())
    }
}

impl Fs {
    /// Walk `path` from the root. With `to_parent` the walk stops one short
    /// and returns the directory that would hold the final component.
    ///
    /// Every directory the walk reads through is verified first, so damage
    /// along the path comes back as [`DfsError::Corrupted`].
    fn namex(&self, path: &str, to_parent: bool) -> Result<(InodeNumber, String)> {
        if !path.starts_with('/') {
            return Err(DfsError::Parse(format!("path {path:?} is not absolute")));
        }
        let mut components = path
            .split('/')
            .filter(|component| !component.is_empty() && *component != ".")
            .peekable();

        let mut cur = InodeNumber::ROOT;
        while let Some(name) = components.next() {
            if to_parent && components.peek().is_none() {
                return Ok((cur, name.to_owned()));
            }
            let inode = self.inode(cur);
            let guard = inode.lock(self)?;
            if guard.cell.record.itype != InodeType::Directory {
                return Err(DfsError::NotDirectory);
            }
            guard.verify()?;
            let Some(next) = guard.lookup(name)? else {
                return Err(DfsError::NotFound(path.to_owned()));
            };
            drop(guard);
            cur = next;
        }

        if to_parent {
            return Err(DfsError::Parse(format!(
                "path {path:?} has no final component"
            )));
        }
        Ok((cur, String::new()))
    }

    /// Resolve an absolute path to its inode.
    pub fn resolve(&self, path: &str) -> Result<InodeNumber> {
        self.namex(path, false).map(|(inum, _)| inum)
    }

    /// Resolve an absolute path to its parent directory and final component.
    pub fn resolve_parent(&self, path: &str) -> Result<(InodeNumber, String)> {
        self.namex(path, true)
    }

    /// Hops from `inum` up to the root, following `..` one lock at a time.
    pub fn dist_to_root(&self, inum: InodeNumber) -> Result<u32> {
        let mut cur = inum;
        let mut depth = 0u32;
        while cur != InodeNumber::ROOT {
            let inode = self.inode(cur);
            let guard = inode.lock(self)?;
            let Some(parent) = guard.lookup("..")? else {
                return Err(DfsError::Format(format!(
                    "directory inode {cur} has no parent entry"
                )));
            };
            drop(guard);
            cur = parent;
            depth += 1;
            if depth > self.sb.inode_count {
                return Err(DfsError::Format(
                    "directory tree contains a cycle".to_owned(),
                ));
            }
        }
        Ok(depth)
    }

    /// Create an inode of `itype` at `path` and link it into its parent.
    ///
    /// New directories get `.` and `..`, bump the parent's link count, and
    /// receive empty replica inodes according to the ditto policy and the
    /// parent's depth from the root. The depth is measured before the parent
    /// lock is taken. Runs inside an open operation.
    pub fn create(&self, path: &str, itype: InodeType) -> Result<InodeNumber> {
        if !matches!(
            itype,
            InodeType::File | InodeType::Directory | InodeType::Device
        ) {
            return Err(DfsError::ContractViolation(format!(
                "cannot create an inode of type {itype} by path"
            )));
        }

        let (parent_inum, name) = self.resolve_parent(path)?;
        if name.len() > DIR_NAME_LEN {
            return Err(DfsError::NameTooLong);
        }
        validate_name(&name).map_err(parse_err)?;

        // Placement depth, measured before the parent lock is held: the `..`
        // walk takes ancestor locks one at a time and must not meet ours.
        let depth = self.dist_to_root(parent_inum)?;

        let parent = self.inode(parent_inum);
        let mut pguard = parent.lock(self)?;
        if pguard.cell.record.itype != InodeType::Directory {
            return Err(DfsError::NotDirectory);
        }
        pguard.verify()?;
        if pguard.lookup(&name)?.is_some() {
            return Err(DfsError::Exists);
        }

        let inum = self.alloc_inode(itype)?;
        let child = self.inode(inum);
        let mut cguard = child.lock(self)?;
        cguard.cell.record.nlink = 1;

        if itype == InodeType::Directory {
            let count = self.options.ditto.replicas_for_depth(depth);
            let mut children = [0u32; 2];
            for slot in children.iter_mut().take(usize::from(count)) {
                let replica = self.alloc_inode(InodeType::DittoReplica)?;
                let rnode = self.inode(replica);
                let mut rguard = rnode.lock(self)?;
                rguard.cell.record.nlink = 1;
                rguard.update()?;
                drop(rguard);
                *slot = replica.0;
            }
            cguard.cell.record.child1 = children[0];
            cguard.cell.record.child2 = children[1];
            cguard.update()?;
            cguard.link(".", inum)?;
            cguard.link("..", parent_inum)?;
            pguard.cell.record.nlink += 1;
            info!(
                target: "dfs::fs",
                path,
                inode = %inum,
                depth,
                replicas = count,
                "created directory"
            );
        } else {
            cguard.update()?;
            debug!(target: "dfs::fs", path, inode = %inum, itype = %itype, "created inode");
        }
        drop(cguard);

        // Also persists the parent's bumped link count through the restamp.
        pguard.link(&name, inum)?;
        Ok(inum)
    }

    /// Create a directory at `path`, with replica placement.
    pub fn mkdir(&self, path: &str) -> Result<InodeNumber> {
        self.create(path, InodeType::Directory)
    }

    /// Create an empty regular file at `path`.
    pub fn create_file(&self, path: &str) -> Result<InodeNumber> {
        self.create(path, InodeType::File)
    }
}
