use log::warn;

use crate::{
    afs,
    block_cache,
    config::{BLOCK_BITS, BLOCK_SIZE},
    layout::DataBlock,
};

/// A free-bitmap block, one bit per device block, `1 << (i % 8)` within
/// each byte
type BitmapBlock = [u8; BLOCK_SIZE];

/// Allocate a free data block on `dev` and mark it used.
///
/// Scans the bitmap linearly in [`BLOCK_BITS`] steps; the last bitmap
/// block covers only the `size % BLOCK_BITS` tail. The claimed bitmap
/// block is written back before the block number is returned. Returns
/// `None` when the device is full; callers decide whether that is a
/// partial write or an error.
pub fn balloc(dev: u32) -> Option<u32> {
    let sb = afs::superblock(dev);
    let size = sb.size as usize;
    for base in (0..size).step_by(BLOCK_BITS) {
        let cache = block_cache::get(dev, sb.bitmap_block(base as u32) as usize);
        let mut guard = cache.lock();
        let claimed = guard.modify(0, |bitmap: &mut BitmapBlock| {
            let bound = BLOCK_BITS.min(size - base);
            for bit in 0..bound {
                let mask = 1u8 << (bit % 8);
                if bitmap[bit / 8] & mask == 0 {
                    bitmap[bit / 8] |= mask;
                    return Some((base + bit) as u32);
                }
            }
            None
        });
        if let Some(bno) = claimed {
            guard.sync();
            return Some(bno);
        }
    }
    warn!("balloc: device {dev} out of blocks");
    None
}

/// Free the block `bno` on `dev`.
///
/// The block contents are zeroed on disk before the bitmap bit is
/// cleared, so freed data never leaks into the next allocation.
/// Panics if the bit was already clear.
pub fn bfree(dev: u32, bno: u32) {
    bzero(dev, bno);
    let sb = afs::superblock(dev);
    let cache = block_cache::get(dev, sb.bitmap_block(bno) as usize);
    let mut guard = cache.lock();
    guard.modify(0, |bitmap: &mut BitmapBlock| {
        let bit = bno as usize % BLOCK_BITS;
        let mask = 1u8 << (bit % 8);
        assert!(bitmap[bit / 8] & mask != 0, "bfree: freeing free block");
        bitmap[bit / 8] &= !mask;
    });
    guard.sync();
}

/// Overwrite the block `bno` with zeros, synchronously
pub fn bzero(dev: u32, bno: u32) {
    let cache = block_cache::get(dev, bno as usize);
    let mut guard = cache.lock();
    guard.modify(0, |block: &mut DataBlock| block.fill(0));
    guard.sync();
}
