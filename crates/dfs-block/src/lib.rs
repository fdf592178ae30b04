#![forbid(unsafe_code)]
//! Byte device abstraction and the block buffer cache.
//!
//! [`ByteDevice`] is the seam between the storage stack and its backing
//! store: positioned reads and writes against a fixed-length byte range.
//! [`FileByteDevice`] backs it with a disk image file, [`MemByteDevice`]
//! with an in-memory vector for tests and benchmarks.
//!
//! [`BufCache`] sits on top and is the only path through which the
//! filesystem layer touches blocks; see the [`cache`] module.

pub mod cache;

pub use cache::{BlockGuard, BufCache, CacheStats, DEFAULT_CAPACITY};

use dfs_error::{DfsError, Result};
use dfs_types::SECTOR_SIZE;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// One cached block's worth of bytes.
pub type BlockData = [u8; SECTOR_SIZE];

/// Positioned I/O against a fixed-length byte range.
///
/// Implementations are shared across threads; reads and writes at disjoint
/// offsets may proceed concurrently.
pub trait ByteDevice: Send + Sync {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`. The device never grows.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Device length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_bounds(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let Some(end) = offset.checked_add(len as u64) else {
        return Err(DfsError::Format(format!(
            "device access overflows: offset={offset} len={len}"
        )));
    };
    if end > device_len {
        return Err(DfsError::Format(format!(
            "device access past end: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// A disk image file.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, read-write if permissions allow, falling
    /// back to read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| File::open(path).map(|file| (file, false)))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DfsError::Io(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        check_bounds(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// In-memory device for tests and benchmarks.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the full device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.bytes.lock().len() as u64
    }
}
