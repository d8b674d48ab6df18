//! Tunable sizes of the on-media structures.

/// Longest file name storable in a dentry, excluding the NUL terminator.
pub const MAX_FILE_NAME: usize = 255;

/// Dentry slots per directory node.
// TODO(layout): tweak so a directory node fits a nicer number of pages.
pub const NUM_DENTRIES: usize = 100;

/// Block slots per block array node.
pub const MAX_NUM_BLOCKS: usize = 100;

/// Inode slots per opened-inodes array node.
pub const INODES_PER_ARRAY: usize = 64;

/// Smallest pool a caller may create.
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Block-size ladder used when no explicit block size is configured.
/// Chosen by the length of the write that first touches the block.
pub const BLOCK_SIZE_SMALL: usize = 16 * 1024;
pub const BLOCK_SIZE_MEDIUM: usize = 256 * 1024;
pub const BLOCK_SIZE_LARGE: usize = 4 * 1024 * 1024;
pub const BLOCK_SIZE_HUGE: usize = 64 * 1024 * 1024;

/// Write lengths at which the ladder steps up.
pub const WRITE_SMALL: usize = 4096;
pub const WRITE_MEDIUM: usize = 64 * 1024;
pub const WRITE_LARGE: usize = 1024 * 1024;

/// Library version reported by `check_version`.
pub const MAJOR_VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 0;
