use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::NDEV;

/// Trait for block devices which read and write whole blocks
pub trait BlockDevice: Send + Sync {
    /// Read the block `block_id` into `buf`
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write `buf` to the block `block_id`
    fn write_block(&self, block_id: usize, buf: &[u8]);
}

lazy_static! {
    /// Block devices by device number, filled by [`attach`]
    static ref BLOCK_DEVICES: Mutex<[Option<Arc<dyn BlockDevice>>; NDEV]> =
        Mutex::new(core::array::from_fn(|_| None));
}

/// Register a block device under a device number.
///
/// Every operation of this crate addresses blocks as `(dev, block_id)`
/// and resolves the device through this table.
pub fn attach(dev: u32, device: Arc<dyn BlockDevice>) {
    BLOCK_DEVICES.lock()[dev as usize] = Some(device);
}

/// Look up an attached device. Addressing an unattached device number
/// is a structural error.
pub(crate) fn device(dev: u32) -> Arc<dyn BlockDevice> {
    BLOCK_DEVICES.lock()[dev as usize]
        .as_ref()
        .unwrap_or_else(|| panic!("no block device {dev}"))
        .clone()
}
