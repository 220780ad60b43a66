//! An xv6-flavored on-disk filesystem keeping a per-block Adler-32
//! checksum next to every block pointer.
//!
//! Blocks are addressed as `(dev, block_id)` over attached
//! [`BlockDevice`]s. On top of the raw device sit, in order, a
//! write-back block cache, the free-bitmap block allocator, the inode
//! layer with its reference-counted cache, the directory layer and path
//! resolution.

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

mod afs;
mod bitmap;
mod block_cache;
mod block_dev;
mod config;
mod dev;
mod error;
mod layout;
mod path;
mod vfs;

pub use afs::{iinit, mkfs};
pub use block_cache::{flush, sync_all};
pub use block_dev::{attach, BlockDevice};
pub use config::{BLOCK_SIZE, MAXFILE, NAME_LENGTH, NDIRECT, ROOT_DEV, ROOT_INODE};
pub use dev::{register_device, CharDevice};
pub use error::FsError;
pub use layout::{InodeKind, Stat, IPB};
pub use path::{namei, nameiparent, skip_elem};
pub use vfs::{ialloc, root_inode, Inode, InodeData, InodeGuard};
