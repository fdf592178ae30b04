//! Scripted end-to-end scenarios run by the harness binary.

use crate::{Workbench, patterned};
use anyhow::{Context, Result, ensure};
use dfs_error::DfsError;
use dfs_inject::Injector;
use dfs_types::InodeNumber;
use serde::Serialize;

/// Knobs for [`run_self_heal`].
#[derive(Debug, Clone)]
pub struct SelfHealConfig {
    pub seed: u64,
    pub file_count: usize,
    pub file_bytes: usize,
    /// One flip per this many bits, on average. Non-positive disables rot.
    pub flip_chance: i64,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            file_count: 4,
            file_bytes: 3 * 512 + 77,
            flip_chance: 8,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SelfHealReport {
    pub files: usize,
    pub corrupted: usize,
    pub rescued: usize,
    pub bits_flipped: u64,
    pub passed: bool,
}

/// The full corruption story: populate and replicate a set of files, rot
/// every primary on the unmounted image, then remount, detect, rescue from
/// the first replica, and prove the content round-trips.
pub fn run_self_heal(config: &SelfHealConfig) -> Result<SelfHealReport> {
    let bench = Workbench::new()?;

    let mut files: Vec<(String, InodeNumber, Vec<u8>)> = Vec::new();
    {
        let mgr = bench.mount()?;
        for index in 0..config.file_count {
            let path = format!("/file{index}");
            let data = patterned(config.file_bytes, config.seed + index as u64);
            let inum = mgr.import(&path, &data)?;
            mgr.duplicate(&path, 2)?;
            files.push((path, inum, data));
        }
    }

    let mut bits_flipped = 0u64;
    {
        let device = bench.device()?;
        let mut injector = Injector::open(&device, config.seed)?;
        for (_, inum, _) in &files {
            bits_flipped += injector.inject(*inum, config.flip_chance)?.bits_flipped;
        }
    }

    let mgr = bench.mount()?;
    let mut corrupted = 0usize;
    let mut rescued = 0usize;
    for (path, _, data) in &files {
        match mgr.verify(path) {
            Ok(_) => {}
            Err(DfsError::Corrupted { .. }) => {
                corrupted += 1;
                let damaged = mgr.read_forced(path)?;
                ensure!(
                    damaged.len() == data.len(),
                    "forced read must serve full content for {path}"
                );
                mgr.rescue(path, 0)?;
                mgr.verify(path)
                    .with_context(|| format!("{path} still corrupt after rescue"))?;
                ensure!(
                    mgr.read_verified(path)? == *data,
                    "{path} content diverged after rescue"
                );
                rescued += 1;
            }
            Err(other) => return Err(other.into()),
        }
    }

    Ok(SelfHealReport {
        files: files.len(),
        corrupted,
        rescued,
        bits_flipped,
        passed: corrupted == rescued,
    })
}
