//! Dispatch for device inodes, a fixed table indexed by major number.

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{config::NDEV, error::FsError};

/// Capability callbacks of one character-device major
#[derive(Clone, Copy)]
pub struct CharDevice {
    /// Fill `buf` from the device, returning the bytes produced
    pub read: fn(minor: i16, buf: &mut [u8]) -> Result<usize, FsError>,
    /// Push `buf` to the device, returning the bytes consumed
    pub write: fn(minor: i16, buf: &[u8]) -> Result<usize, FsError>,
}

lazy_static! {
    static ref DEVICES: Mutex<[Option<CharDevice>; NDEV]> = Mutex::new([None; NDEV]);
}

/// Install the callbacks for a device major
pub fn register_device(major: i16, device: CharDevice) {
    assert!((0..NDEV as i16).contains(&major), "bad device major");
    DEVICES.lock()[major as usize] = Some(device);
}

pub(crate) fn read(major: i16, minor: i16, buf: &mut [u8]) -> Result<usize, FsError> {
    (lookup(major)?.read)(minor, buf)
}

pub(crate) fn write(major: i16, minor: i16, buf: &[u8]) -> Result<usize, FsError> {
    (lookup(major)?.write)(minor, buf)
}

fn lookup(major: i16) -> Result<CharDevice, FsError> {
    if !(0..NDEV as i16).contains(&major) {
        return Err(FsError::BadMajor);
    }
    DEVICES.lock()[major as usize].ok_or(FsError::BadMajor)
}
