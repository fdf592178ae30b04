//! Superblock codec and region layout math.
//!
//! An image is five consecutive regions of 512-byte blocks:
//!
//! | region      | start          | length                      |
//! |-------------|----------------|-----------------------------|
//! | boot        | 0              | 1                           |
//! | superblock  | 1              | 1                           |
//! | inode table | 2              | ceil(inode_count / 4)       |
//! | bitmap      | `bitmap_start` | ceil(total_blocks / 4096)   |
//! | data        | `data_start`   | `data_blocks`               |
//! | log         | `log_start`    | `log_blocks`                |
//!
//! The regions must tile the image exactly; [`Superblock::validate`] rejects
//! anything else before the filesystem layer touches a block.

use crate::inode::INODES_PER_BLOCK;
use dfs_types::{
    BlockNumber, DFS_SUPER_MAGIC, InodeNumber, ParseError, SECTOR_SIZE, ensure_slice,
    ensure_slice_mut, read_le_u32, write_le_u32,
};

/// One bitmap block tracks this many blocks (one bit each).
pub const BITS_PER_BITMAP_BLOCK: usize = SECTOR_SIZE * 8;

/// Smallest usable log: one header block plus one data slot.
pub const MIN_LOG_BLOCKS: u32 = 2;

/// The log header block holds at most (512 - 8) / 4 = 126 slot addresses,
/// so the log region is capped at 127 blocks including the header.
pub const MAX_LOG_BLOCKS: u32 = 127;

/// Superblock, stored at block 1.
///
/// Nine little-endian u32 fields at fixed offsets; the rest of the sector is
/// zero. All region starts are absolute block numbers.
///
/// | offset | field          |
/// |--------|----------------|
/// | 0      | `magic`        |
/// | 4      | `total_blocks` |
/// | 8      | `data_blocks`  |
/// | 12     | `inode_count`  |
/// | 16     | `log_blocks`   |
/// | 20     | `inode_start`  |
/// | 24     | `bitmap_start` |
/// | 28     | `data_start`   |
/// | 32     | `log_start`    |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub total_blocks: u32,
    pub data_blocks: u32,
    pub inode_count: u32,
    pub log_blocks: u32,
    pub inode_start: u32,
    pub bitmap_start: u32,
    pub data_start: u32,
    pub log_start: u32,
}

impl Superblock {
    /// Parse a superblock from one 512-byte block.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let magic = read_le_u32(block, 0)?;
        if magic != DFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DFS_SUPER_MAGIC,
                actual: magic,
            });
        }

        Ok(Self {
            magic,
            total_blocks: read_le_u32(block, 4)?,
            data_blocks: read_le_u32(block, 8)?,
            inode_count: read_le_u32(block, 12)?,
            log_blocks: read_le_u32(block, 16)?,
            inode_start: read_le_u32(block, 20)?,
            bitmap_start: read_le_u32(block, 24)?,
            data_start: read_le_u32(block, 28)?,
            log_start: read_le_u32(block, 32)?,
        })
    }

    /// Encode into one 512-byte block, zeroing the unused tail.
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        block[..SECTOR_SIZE].fill(0);
        write_le_u32(block, 0, self.magic)?;
        write_le_u32(block, 4, self.total_blocks)?;
        write_le_u32(block, 8, self.data_blocks)?;
        write_le_u32(block, 12, self.inode_count)?;
        write_le_u32(block, 16, self.log_blocks)?;
        write_le_u32(block, 20, self.inode_start)?;
        write_le_u32(block, 24, self.bitmap_start)?;
        write_le_u32(block, 28, self.data_start)?;
        write_le_u32(block, 32, self.log_start)?;
        Ok(())
    }

    /// Derive a full layout from the three free parameters.
    ///
    /// Region starts follow from `inode_count` and `total_blocks`; the data
    /// region absorbs whatever remains between the bitmap and the log. Fails
    /// if the remainder is empty.
    pub fn compute(
        total_blocks: u32,
        inode_count: u32,
        log_blocks: u32,
    ) -> Result<Self, ParseError> {
        if inode_count < 2 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "must be at least 2",
            });
        }
        if log_blocks < MIN_LOG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "log_blocks",
                reason: "must be at least 2",
            });
        }
        if log_blocks > MAX_LOG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "log_blocks",
                reason: "exceeds log header capacity",
            });
        }

        let inode_table_blocks = inode_count.div_ceil(INODES_PER_BLOCK as u32);
        let bitmap_blocks = total_blocks.div_ceil(BITS_PER_BITMAP_BLOCK as u32);

        let inode_start = 2_u32;
        let bitmap_start = u64::from(inode_start) + u64::from(inode_table_blocks);
        let data_start = bitmap_start + u64::from(bitmap_blocks);
        let log_start = u64::from(total_blocks).saturating_sub(u64::from(log_blocks));

        if data_start >= log_start {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "too small for layout",
            });
        }

        let sb = Self {
            magic: DFS_SUPER_MAGIC,
            total_blocks,
            data_blocks: (log_start - data_start) as u32,
            inode_count,
            log_blocks,
            inode_start,
            bitmap_start: bitmap_start as u32,
            data_start: data_start as u32,
            log_start: log_start as u32,
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Check that the five regions are ordered, sized, and tile the image.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != DFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DFS_SUPER_MAGIC,
                actual: self.magic,
            });
        }
        if self.inode_count < 2 {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "must be at least 2",
            });
        }
        if self.log_blocks < MIN_LOG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "log_blocks",
                reason: "must be at least 2",
            });
        }
        if self.log_blocks > MAX_LOG_BLOCKS {
            return Err(ParseError::InvalidField {
                field: "log_blocks",
                reason: "exceeds log header capacity",
            });
        }
        if self.inode_start != 2 {
            return Err(ParseError::InvalidField {
                field: "inode_start",
                reason: "must be 2",
            });
        }

        // Widen to u64 so region sums cannot wrap.
        let bitmap_start = 2 + u64::from(self.inode_table_blocks());
        if u64::from(self.bitmap_start) != bitmap_start {
            return Err(ParseError::InvalidField {
                field: "bitmap_start",
                reason: "does not follow inode table",
            });
        }
        let data_start = bitmap_start + u64::from(self.bitmap_blocks());
        if u64::from(self.data_start) != data_start {
            return Err(ParseError::InvalidField {
                field: "data_start",
                reason: "does not follow bitmap",
            });
        }
        if self.data_blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "data_blocks",
                reason: "must be nonzero",
            });
        }
        let log_start = data_start + u64::from(self.data_blocks);
        if u64::from(self.log_start) != log_start {
            return Err(ParseError::InvalidField {
                field: "log_start",
                reason: "does not follow data region",
            });
        }
        if log_start + u64::from(self.log_blocks) != u64::from(self.total_blocks) {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "regions do not tile image",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        self.inode_count.div_ceil(INODES_PER_BLOCK as u32)
    }

    #[must_use]
    pub fn bitmap_blocks(&self) -> u32 {
        self.total_blocks.div_ceil(BITS_PER_BITMAP_BLOCK as u32)
    }

    /// Block holding the record for `inum`.
    #[must_use]
    pub fn inode_block(&self, inum: InodeNumber) -> BlockNumber {
        BlockNumber(u64::from(self.inode_start) + u64::from(inum.0) / INODES_PER_BLOCK as u64)
    }

    /// Byte offset of the record for `inum` within its block.
    #[must_use]
    pub fn inode_offset(inum: InodeNumber) -> usize {
        (inum.0 as usize % INODES_PER_BLOCK) * crate::inode::INODE_RECORD_SIZE
    }

    /// Bitmap block holding the bit for `block`.
    #[must_use]
    pub fn bitmap_block_for(&self, block: BlockNumber) -> BlockNumber {
        BlockNumber(u64::from(self.bitmap_start) + block.0 / BITS_PER_BITMAP_BLOCK as u64)
    }

    /// Bit index of `block` within its bitmap block.
    #[must_use]
    pub fn bitmap_bit_for(block: BlockNumber) -> usize {
        (block.0 % BITS_PER_BITMAP_BLOCK as u64) as usize
    }
}

pub fn bitmap_get(block: &[u8], bit: usize) -> Result<bool, ParseError> {
    let byte = ensure_slice(block, bit / 8, 1)?[0];
    Ok(byte & (1 << (bit % 8)) != 0)
}

pub fn bitmap_set(block: &mut [u8], bit: usize) -> Result<(), ParseError> {
    let byte = ensure_slice_mut(block, bit / 8, 1)?;
    byte[0] |= 1 << (bit % 8);
    Ok(())
}

pub fn bitmap_clear(block: &mut [u8], bit: usize) -> Result<(), ParseError> {
    let byte = ensure_slice_mut(block, bit / 8, 1)?;
    byte[0] &= !(1 << (bit % 8));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_layout() -> Superblock {
        Superblock::compute(2048, 200, 30).expect("default layout")
    }

    #[test]
    fn compute_default_geometry() {
        let sb = default_layout();
        assert_eq!(sb.magic, DFS_SUPER_MAGIC);
        assert_eq!(sb.inode_start, 2);
        // 200 records, 4 per block
        assert_eq!(sb.inode_table_blocks(), 50);
        assert_eq!(sb.bitmap_start, 52);
        // 2048 blocks fit in a single bitmap block
        assert_eq!(sb.bitmap_blocks(), 1);
        assert_eq!(sb.data_start, 53);
        assert_eq!(sb.log_start, 2018);
        assert_eq!(sb.data_blocks, 2018 - 53);
        sb.validate().expect("computed layout validates");
    }

    #[test]
    fn superblock_round_trip() {
        let sb = default_layout();
        let mut block = [0xFF_u8; SECTOR_SIZE];
        sb.encode_into(&mut block).expect("encode");
        let parsed = Superblock::parse(&block).expect("parse");
        assert_eq!(parsed, sb);
        // Tail past the fields is zeroed
        assert!(block[36..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut block = [0_u8; SECTOR_SIZE];
        default_layout().encode_into(&mut block).expect("encode");
        block[0] ^= 0xFF;
        let err = Superblock::parse(&block).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn parse_rejects_short_block() {
        let err = Superblock::parse(&[0_u8; 100]).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: 100,
            }
        );
    }

    #[test]
    fn validate_rejects_misplaced_regions() {
        let mut sb = default_layout();
        sb.bitmap_start += 1;
        assert!(matches!(
            sb.validate().unwrap_err(),
            ParseError::InvalidField {
                field: "bitmap_start",
                ..
            }
        ));

        let mut sb = default_layout();
        sb.data_blocks -= 1;
        assert!(matches!(
            sb.validate().unwrap_err(),
            ParseError::InvalidField {
                field: "log_start",
                ..
            }
        ));

        let mut sb = default_layout();
        sb.total_blocks += 8;
        assert!(matches!(
            sb.validate().unwrap_err(),
            ParseError::InvalidField { .. }
        ));
    }

    #[test]
    fn validate_bounds_log_blocks() {
        assert!(Superblock::compute(2048, 200, 1).is_err());
        assert!(Superblock::compute(2048, 200, 128).is_err());
        assert!(Superblock::compute(2048, 200, 127).is_ok());
        assert!(Superblock::compute(2048, 200, 2).is_ok());
    }

    #[test]
    fn compute_rejects_tiny_image() {
        // 2 boot/super + 50 inode + 1 bitmap + 30 log leaves no data region
        assert!(Superblock::compute(83, 200, 30).is_err());
        assert!(Superblock::compute(84, 200, 30).is_ok());
    }

    #[test]
    fn inode_addressing() {
        let sb = default_layout();
        assert_eq!(sb.inode_block(InodeNumber(0)), BlockNumber(2));
        assert_eq!(sb.inode_block(InodeNumber(3)), BlockNumber(2));
        assert_eq!(sb.inode_block(InodeNumber(4)), BlockNumber(3));
        assert_eq!(Superblock::inode_offset(InodeNumber(0)), 0);
        assert_eq!(Superblock::inode_offset(InodeNumber(1)), 128);
        assert_eq!(Superblock::inode_offset(InodeNumber(7)), 384);
    }

    #[test]
    fn bitmap_addressing() {
        let sb = default_layout();
        assert_eq!(sb.bitmap_block_for(BlockNumber(0)), BlockNumber(52));
        assert_eq!(sb.bitmap_block_for(BlockNumber(4095)), BlockNumber(52));
        assert_eq!(Superblock::bitmap_bit_for(BlockNumber(53)), 53);
        assert_eq!(Superblock::bitmap_bit_for(BlockNumber(4097)), 1);
    }

    #[test]
    fn bitmap_bit_ops() {
        let mut block = [0_u8; SECTOR_SIZE];
        assert!(!bitmap_get(&block, 53).unwrap());
        bitmap_set(&mut block, 53).unwrap();
        assert!(bitmap_get(&block, 53).unwrap());
        assert_eq!(block[6], 1 << 5);
        // Neighbors untouched
        assert!(!bitmap_get(&block, 52).unwrap());
        assert!(!bitmap_get(&block, 54).unwrap());
        bitmap_clear(&mut block, 53).unwrap();
        assert!(!bitmap_get(&block, 53).unwrap());

        assert!(bitmap_get(&block, SECTOR_SIZE * 8).is_err());
        assert!(bitmap_set(&mut block, SECTOR_SIZE * 8).is_err());
    }
}
