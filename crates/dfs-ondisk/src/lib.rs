#![forbid(unsafe_code)]
//! On-disk format codecs for DittoFS images.
//!
//! Pure codec crate — no I/O, no side effects. Parses and encodes the
//! sector-sized structures an image is made of: the superblock and region
//! layout, 128-byte inode records, 16-byte directory entries, allocation
//! bitmap bits, and the XOR-fold content checksum stored in every inode.

pub mod checksum;
pub mod inode;
pub mod layout;

pub use checksum::{CHECKSUM_WINDOW, ContentChecksum};
pub use inode::{
    DIRENTS_PER_BLOCK, DIRENT_SIZE, DIR_NAME_LEN, Dirent, INODES_PER_BLOCK, INODE_RECORD_SIZE,
    InodeRecord, InodeType, MAX_FILE_BLOCKS, NDIRECT, NINDIRECT, clear_dirent, encode_dirent,
    parse_dirent, validate_name,
};
pub use layout::{
    BITS_PER_BITMAP_BLOCK, MAX_LOG_BLOCKS, MIN_LOG_BLOCKS, Superblock, bitmap_clear, bitmap_get,
    bitmap_set,
};
