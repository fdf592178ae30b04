//! Inode record and directory entry codecs.

use dfs_types::{
    InodeNumber, ParseError, ensure_slice, ensure_slice_mut, read_le_u16, read_le_u32,
    trim_nul_padded, write_le_u16, write_le_u32,
};
use serde::Serialize;
use std::fmt;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Block pointers in the single indirect block (512 / 4).
pub const NINDIRECT: usize = 128;

/// Largest file in blocks: direct plus one indirect block.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// Bytes per inode table record.
pub const INODE_RECORD_SIZE: usize = 128;

/// Records per inode table block.
pub const INODES_PER_BLOCK: usize = 4;

/// Bytes per directory entry.
pub const DIRENT_SIZE: usize = 16;

/// Directory entries per block.
pub const DIRENTS_PER_BLOCK: usize = 32;

/// Maximum name length in a directory entry (NUL-padded, not terminated).
pub const DIR_NAME_LEN: usize = 14;

/// On-disk inode type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InodeType {
    Free,
    File,
    Directory,
    Device,
    DittoReplica,
}

impl InodeType {
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Free => 0,
            Self::File => 1,
            Self::Directory => 2,
            Self::Device => 3,
            Self::DittoReplica => 4,
        }
    }
}

impl TryFrom<u16> for InodeType {
    type Error = ParseError;

    fn try_from(raw: u16) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Free),
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            3 => Ok(Self::Device),
            4 => Ok(Self::DittoReplica),
            _ => Err(ParseError::InvalidField {
                field: "itype",
                reason: "unknown inode type",
            }),
        }
    }
}

impl fmt::Display for InodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::File => "file",
            Self::Directory => "directory",
            Self::Device => "device",
            Self::DittoReplica => "ditto_replica",
        };
        write!(f, "{name}")
    }
}

/// One 128-byte slot in the inode table.
///
/// | offset | field                                |
/// |--------|--------------------------------------|
/// | 0      | `itype` (u16)                        |
/// | 2      | `major` (u16)                        |
/// | 4      | `minor` (u16)                        |
/// | 6      | `nlink` (u16)                        |
/// | 8      | `size` (u32)                         |
/// | 12     | `addrs` (13 × u32, last is indirect) |
/// | 64     | `child1` (u32, replica inode or 0)   |
/// | 68     | `child2` (u32, replica inode or 0)   |
/// | 72     | `checksum` (u32, XOR-fold of content)|
/// | 76     | reserved, zero                       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRecord {
    pub itype: InodeType,
    pub major: u16,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
    pub child1: u32,
    pub child2: u32,
    pub checksum: u32,
}

impl InodeRecord {
    /// A freshly wiped record: type Free, everything zero.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            itype: InodeType::Free,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
            child1: 0,
            child2: 0,
            checksum: 0,
        }
    }

    /// Parse a record from its 128-byte table slot.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let itype = InodeType::try_from(read_le_u16(data, 0)?)?;
        let mut addrs = [0_u32; NDIRECT + 1];
        for (i, addr) in addrs.iter_mut().enumerate() {
            *addr = read_le_u32(data, 12 + i * 4)?;
        }

        Ok(Self {
            itype,
            major: read_le_u16(data, 2)?,
            minor: read_le_u16(data, 4)?,
            nlink: read_le_u16(data, 6)?,
            size: read_le_u32(data, 8)?,
            addrs,
            child1: read_le_u32(data, 64)?,
            child2: read_le_u32(data, 68)?,
            checksum: read_le_u32(data, 72)?,
        })
    }

    /// Encode into a 128-byte table slot, zeroing the reserved tail.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: out.len(),
            });
        }

        out[..INODE_RECORD_SIZE].fill(0);
        write_le_u16(out, 0, self.itype.to_u16())?;
        write_le_u16(out, 2, self.major)?;
        write_le_u16(out, 4, self.minor)?;
        write_le_u16(out, 6, self.nlink)?;
        write_le_u32(out, 8, self.size)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            write_le_u32(out, 12 + i * 4, *addr)?;
        }
        write_le_u32(out, 64, self.child1)?;
        write_le_u32(out, 68, self.child2)?;
        write_le_u32(out, 72, self.checksum)?;
        Ok(())
    }

    /// Replica slots in rescue order.
    #[must_use]
    pub fn children(&self) -> [u32; 2] {
        [self.child1, self.child2]
    }
}

/// Decoded directory entry. `inum` 0 marks a free slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dirent {
    pub inum: InodeNumber,
    pub name: String,
}

/// Parse the entry in `slot` of a directory block.
pub fn parse_dirent(block: &[u8], slot: usize) -> Result<Dirent, ParseError> {
    if slot >= DIRENTS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "slot",
            reason: "past end of directory block",
        });
    }
    let entry = ensure_slice(block, slot * DIRENT_SIZE, DIRENT_SIZE)?;
    Ok(Dirent {
        inum: InodeNumber(u32::from(read_le_u16(entry, 0)?)),
        name: trim_nul_padded(&entry[2..]),
    })
}

/// Write `name -> inum` into `slot` of a directory block.
pub fn encode_dirent(
    block: &mut [u8],
    slot: usize,
    inum: InodeNumber,
    name: &str,
) -> Result<(), ParseError> {
    validate_name(name)?;
    if slot >= DIRENTS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "slot",
            reason: "past end of directory block",
        });
    }
    let Ok(short) = u16::try_from(inum.0) else {
        return Err(ParseError::IntegerConversion { field: "inum" });
    };

    let entry = ensure_slice_mut(block, slot * DIRENT_SIZE, DIRENT_SIZE)?;
    entry.fill(0);
    write_le_u16(entry, 0, short)?;
    entry[2..2 + name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

/// Free `slot` by zeroing the whole entry.
pub fn clear_dirent(block: &mut [u8], slot: usize) -> Result<(), ParseError> {
    if slot >= DIRENTS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "slot",
            reason: "past end of directory block",
        });
    }
    let entry = ensure_slice_mut(block, slot * DIRENT_SIZE, DIRENT_SIZE)?;
    entry.fill(0);
    Ok(())
}

/// Names must fit the fixed-width field and survive NUL-padded decoding.
pub fn validate_name(name: &str) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "empty",
        });
    }
    if name.len() > DIR_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than 14 bytes",
        });
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "contains NUL or slash",
        });
    }
    Ok(())
}
