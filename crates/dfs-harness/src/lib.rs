#![forbid(unsafe_code)]

//! Image-building fixtures for DittoFS end-to-end suites.
//!
//! A [`Workbench`] is a formatted image file in its own temp directory; the
//! suites mount it, rot it with the injector between mounts, and mount it
//! again, the way an operator would cycle a real disk.

pub mod e2e;

use anyhow::{Context, Result};
use dfs_block::{BufCache, FileByteDevice};
use dfs_ditto::DittoManager;
use dfs_fs::{Fs, FsOptions, mkfs};
use dfs_types::{DeviceId, InodeNumber, SECTOR_SIZE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Device id the harness mounts images under.
pub const HARNESS_DEV: DeviceId = DeviceId(1);

/// A formatted scratch image in its own temp directory.
pub struct Workbench {
    dir: TempDir,
    path: PathBuf,
}

impl Workbench {
    /// A 512-block image with 64 inodes and a 12-block log: small enough
    /// that exhaustion paths are reachable, large enough for real trees.
    pub fn new() -> Result<Self> {
        Self::with_geometry(512, 64, 12)
    }

    pub fn with_geometry(total_blocks: u32, inode_count: u32, log_blocks: u32) -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let path = dir.path().join("dfs.img");
        let device = FileByteDevice::create(&path, u64::from(total_blocks) * SECTOR_SIZE as u64)
            .with_context(|| format!("create image {}", path.display()))?;
        mkfs(&device, total_blocks, inode_count, log_blocks)
            .with_context(|| format!("format image {}", path.display()))?;
        Ok(Self { dir, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host-side scratch space next to the image, for `put`-style sources.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Open a fresh descriptor on the raw image.
    pub fn device(&self) -> Result<FileByteDevice> {
        FileByteDevice::open(&self.path)
            .with_context(|| format!("open image {}", self.path.display()))
    }

    /// Mount with default options.
    pub fn mount(&self) -> Result<DittoManager> {
        self.mount_with(FsOptions::default())
    }

    pub fn mount_with(&self, options: FsOptions) -> Result<DittoManager> {
        let device = Arc::new(self.device()?);
        let cache = Arc::new(BufCache::new(options.cache_capacity));
        let fs = Fs::mount(cache, HARNESS_DEV, device, options)
            .with_context(|| format!("mount image {}", self.path.display()))?;
        Ok(DittoManager::new(Arc::new(fs)))
    }
}

/// Deterministic content, distinct across seeds.
#[must_use]
pub fn patterned(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| (((i as u64).wrapping_mul(seed | 1).wrapping_add(seed)) % 251) as u8)
        .collect()
}

/// Create `/d0`, `/d0/d1`, ... `depth` levels down, returning each
/// directory's inode outermost first.
pub fn nested_dirs(mgr: &DittoManager, depth: usize) -> Result<Vec<InodeNumber>> {
    let mut path = String::new();
    let mut dirs = Vec::with_capacity(depth);
    for level in 0..depth {
        path.push_str(&format!("/d{level}"));
        dirs.push(mgr.mkdir(&path)?);
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workbench_mounts_a_fresh_image() {
        let bench = Workbench::new().expect("workbench");
        let mgr = bench.mount().expect("mount");
        assert_eq!(
            mgr.fs().resolve("/").expect("resolve root"),
            InodeNumber::ROOT
        );
    }

    #[test]
    fn workbench_survives_a_remount_cycle() {
        let bench = Workbench::new().expect("workbench");
        let data = patterned(900, 5);
        {
            let mgr = bench.mount().expect("mount");
            mgr.import("/kept", &data).expect("import");
        }
        let mgr = bench.mount().expect("remount");
        assert_eq!(mgr.read_verified("/kept").expect("read"), data);
    }

    #[test]
    fn patterned_content_is_seed_distinct() {
        assert_eq!(patterned(64, 3), patterned(64, 3));
        assert_ne!(patterned(64, 3), patterned(64, 4));
    }

    #[test]
    fn nested_dirs_build_a_resolvable_chain() {
        let bench = Workbench::new().expect("workbench");
        let mgr = bench.mount().expect("mount");
        let dirs = nested_dirs(&mgr, 3).expect("nested dirs");
        assert_eq!(dirs.len(), 3);
        assert_eq!(mgr.fs().resolve("/d0/d1/d2").expect("resolve"), dirs[2]);
    }
}
