use lazy_static::lazy_static;
use log::info;
use spin::Mutex;

use crate::{
    block_cache,
    config::{BLOCK_BITS, NDEV, ROOT_INODE},
    layout::{DataBlock, InodeKind, SuperBlock},
    vfs,
};

lazy_static! {
    /// Parsed super blocks by device number, filled by [`iinit`]
    static ref SUPER_BLOCKS: Mutex<[SuperBlock; NDEV]> =
        Mutex::new([SuperBlock::empty(); NDEV]);
}

/// Read the super block of an attached device into memory.
///
/// Must run once per device before any other operation addresses it.
pub fn iinit(dev: u32) {
    let sb = block_cache::get(dev, 1)
        .lock()
        .read(0, |sb: &SuperBlock| *sb);
    assert!(sb.size > 0, "iinit: device {dev} has no filesystem");
    info!(
        "fs on dev {dev}: {} blocks ({} data from block {}), {} inodes",
        sb.size,
        sb.nblocks,
        sb.data_start(),
        sb.ninodes
    );
    SUPER_BLOCKS.lock()[dev as usize] = sb;
}

/// The super block of `dev`. Panics when [`iinit`] has not run.
pub(crate) fn superblock(dev: u32) -> SuperBlock {
    let sb = SUPER_BLOCKS.lock()[dev as usize];
    assert!(sb.size > 0, "superblock: device {dev} not initialized");
    sb
}

/// Build an empty filesystem on an attached device.
///
/// Zeroes the image, writes the super block, reserves the metadata
/// blocks in the free bitmap and creates the root directory. The device
/// is left initialized as if [`iinit`] had run.
pub fn mkfs(dev: u32, total_blocks: u32, ninodes: u32) {
    let sb = SuperBlock {
        size: total_blocks,
        nblocks: 0,
        ninodes,
    };
    let reserved = sb.data_start();
    assert!(reserved < total_blocks, "mkfs: device too small");
    let sb = SuperBlock {
        nblocks: total_blocks - reserved,
        ..sb
    };

    // clear all blocks
    for block_id in 0..total_blocks as usize {
        block_cache::get(dev, block_id)
            .lock()
            .modify(0, |block: &mut DataBlock| block.fill(0));
    }

    // super block
    block_cache::get(dev, 1)
        .lock()
        .modify(0, |disk_sb: &mut SuperBlock| *disk_sb = sb);
    SUPER_BLOCKS.lock()[dev as usize] = sb;

    // boot, super, inode table and bitmap blocks are permanently in use
    for bno in 0..reserved {
        block_cache::get(dev, sb.bitmap_block(bno) as usize)
            .lock()
            .modify(0, |bitmap: &mut DataBlock| {
                let bit = bno as usize % BLOCK_BITS;
                bitmap[bit / 8] |= 1 << (bit % 8);
            });
    }

    // root directory
    let root = vfs::ialloc(dev, InodeKind::Directory, 0, 0);
    assert_eq!(root.inum(), ROOT_INODE, "mkfs: root inode out of place");
    let mut guard = root.lock();
    guard.set_nlink(1);
    guard.update();
    drop(guard);
    drop(root);

    block_cache::sync_all();
    info!("mkfs on dev {dev}: {total_blocks} blocks, {ninodes} inodes");
}
