/// Use a block size of 512 bytes
pub const BLOCK_SIZE: usize = 512;
/// Number of bitmap bits in a block
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// Use a block cache of 64 blocks
pub const BLOCK_CACHE_SIZE: usize = 64;

/// Number of u32 entries in a raw block
pub const ENTRY_COUNT: usize = BLOCK_SIZE / 4;

/// The number of direct block slots in an inode
pub const NDIRECT: usize = 12;
/// Half-block span of an indirect block: the pointer at index `j` is
/// paired with its checksum at index `j + NINDIRECT` of the same block
pub const NINDIRECT: usize = ENTRY_COUNT / 2;
/// Live pointer slots per indirect block, single and inner alike
pub const INDIRECT_COUNT: usize = NINDIRECT - 1;
/// Data blocks reachable through the double-indirect root, which holds
/// one pointer per inner-indirect block and no checksums of its own
pub const DOUBLE_COUNT: usize = ENTRY_COUNT * INDIRECT_COUNT;

/// The upper bound of direct block indices
pub const DIRECT_BOUND: usize = NDIRECT;
/// The upper bound of single-indirect block indices
pub const INDIRECT1_BOUND: usize = DIRECT_BOUND + INDIRECT_COUNT;
/// The largest expressible file length in blocks
pub const MAXFILE: usize = INDIRECT1_BOUND + DOUBLE_COUNT;

/// The max length of a directory entry name
pub const NAME_LENGTH: usize = 14;

/// Number of in-memory inode cache slots
pub const NINODE: usize = 50;
/// Number of block devices and of character-device majors
pub const NDEV: usize = 10;

/// Device number holding the root directory of absolute paths
pub const ROOT_DEV: u32 = 1;
/// Inode number of a device's root directory
pub const ROOT_INODE: u32 = 1;
