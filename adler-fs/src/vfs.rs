//! In-memory inode layer: the inode cache, reference handles and the
//! checksummed read/write paths.
//!
//! Synchronization is two-level. A single spinlock guards the cache
//! table (slot membership and reference counts); each slot additionally
//! carries its own lock around the cached disk inode, held across block
//! I/O. Holding the slot lock is what owning an [`InodeGuard`] means,
//! so an inode can never be unlocked twice or updated while unlocked.

use adler::adler32_slice;
use lazy_static::lazy_static;
use log::error;
use spin::{Mutex, MutexGuard};

use crate::{
    afs, bitmap, block_cache,
    config::{BLOCK_SIZE, INDIRECT_COUNT, MAXFILE, NDIRECT, NINODE, ROOT_INODE},
    dev,
    error::FsError,
    layout::{
        paired_checksum, tier_of, DataBlock, DirEntry, DiskInode, IndirectBlock, InodeKind, Stat,
        SuperBlock, Tier, DIRENT_SIZE, DOUBLE_ROOT, SINGLE_ROOT,
    },
};

struct InodeMeta {
    dev: u32,
    inum: u32,
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

struct InodeCache {
    meta: Mutex<[InodeMeta; NINODE]>,
    data: [Mutex<InodeData>; NINODE],
}

lazy_static! {
    /// The global inode cache
    static ref INODE_CACHE: InodeCache = InodeCache::new();
}

impl InodeCache {
    fn new() -> Self {
        Self {
            meta: Mutex::new(core::array::from_fn(|_| InodeMeta::new())),
            data: core::array::from_fn(|_| Mutex::new(InodeData::new())),
        }
    }

    /// Find the cached inode `(dev, inum)` or claim a free slot for it,
    /// without touching the disk. The returned handle is unlocked.
    fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut meta = self.meta.lock();
        let mut free = None;
        for (i, m) in meta.iter_mut().enumerate() {
            if m.refs > 0 && m.dev == dev && m.inum == inum {
                m.refs += 1;
                return Inode { dev, inum, index: i };
            }
            if free.is_none() && m.refs == 0 {
                free = Some(i);
            }
        }
        let i = free.expect("iget: inode cache exhausted");
        meta[i] = InodeMeta { dev, inum, refs: 1 };
        // the slot may still hold its previous tenant's copy
        self.data[i].lock().valid = false;
        Inode { dev, inum, index: i }
    }

    fn dup(&self, inode: &Inode) -> Inode {
        self.meta.lock()[inode.index].refs += 1;
        Inode {
            dev: inode.dev,
            inum: inode.inum,
            index: inode.index,
        }
    }

    /// Drop one reference. The last reference to an unlinked inode
    /// frees its contents and its on-disk slot before the cache slot is
    /// released.
    fn put(&self, inode: &Inode) {
        let mut meta = self.meta.lock();
        let i = inode.index;
        if meta[i].refs == 1 {
            // last reference, so the slot lock cannot be contended
            let mut data = self.data[i].try_lock().expect("iput: inode busy");
            if data.valid && data.dinode.nlink == 0 {
                drop(meta);
                data.truncate();
                data.dinode.kind = InodeKind::Free;
                data.update();
                data.valid = false;
                drop(data);
                meta = self.meta.lock();
            }
        }
        meta[i].refs -= 1;
    }
}

/// A counted, unlocked reference to a cached inode.
///
/// Cloning bumps the cache reference count; dropping releases it
/// (freeing the inode when it was the last reference to an unlinked
/// file). Lock with [`Inode::lock`] before touching the contents.
pub struct Inode {
    dev: u32,
    inum: u32,
    index: usize,
}

impl Inode {
    /// Device number of this inode
    #[inline]
    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Inode number on its device
    #[inline]
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// Wait for exclusive access to the inode, loading the on-disk copy
    /// on first use. Panics when the on-disk slot is unallocated.
    pub fn lock(&self) -> InodeGuard<'_> {
        let mut data = INODE_CACHE.data[self.index].lock();
        if !data.valid {
            data.dev = self.dev;
            data.inum = self.inum;
            let sb = afs::superblock(self.dev);
            data.dinode = block_cache::get(self.dev, sb.inode_block(self.inum) as usize)
                .lock()
                .read(SuperBlock::inode_offset(self.inum), |d: &DiskInode| *d);
            data.valid = true;
            assert!(
                data.dinode.kind != InodeKind::Free,
                "ilock: unallocated inode"
            );
        }
        data
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        INODE_CACHE.dup(self)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        INODE_CACHE.put(self);
    }
}

/// Exclusive access to a locked inode; dropping it unlocks
pub type InodeGuard<'a> = MutexGuard<'a, InodeData>;

/// Look up an inode by number, yielding an unlocked reference
pub(crate) fn iget(dev: u32, inum: u32) -> Inode {
    INODE_CACHE.get(dev, inum)
}

/// The root directory of a device
pub fn root_inode(dev: u32) -> Inode {
    iget(dev, ROOT_INODE)
}

/// Allocate an on-disk inode of the given kind and return an unlocked
/// reference to it. Panics when the inode table is full.
pub fn ialloc(dev: u32, kind: InodeKind, major: i16, minor: i16) -> Inode {
    let sb = afs::superblock(dev);
    for inum in 1..sb.ninodes {
        let cache = block_cache::get(dev, sb.inode_block(inum) as usize);
        let mut guard = cache.lock();
        let claimed = guard.modify(SuperBlock::inode_offset(inum), |d: &mut DiskInode| {
            if d.kind == InodeKind::Free {
                d.init(kind, major, minor);
                true
            } else {
                false
            }
        });
        if claimed {
            guard.sync();
            drop(guard);
            return iget(dev, inum);
        }
    }
    panic!("ialloc: no free inodes on dev {dev}");
}

/// The cached copy of one disk inode, reachable through [`InodeGuard`]
pub struct InodeData {
    valid: bool,
    dev: u32,
    inum: u32,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: false,
            dev: 0,
            inum: 0,
            dinode: DiskInode::new(),
        }
    }

    /// Kind of this inode
    #[inline]
    pub fn kind(&self) -> InodeKind {
        self.dinode.kind
    }

    /// Byte length of the contents
    #[inline]
    pub fn size(&self) -> u32 {
        self.dinode.size
    }

    /// Directory entries referencing this inode
    #[inline]
    pub fn nlink(&self) -> i16 {
        self.dinode.nlink
    }

    /// Set the link count; callers persist it with [`InodeData::update`]
    #[inline]
    pub fn set_nlink(&mut self, nlink: i16) {
        self.dinode.nlink = nlink;
    }

    /// Write the cached inode back to its disk slot, synchronously
    pub fn update(&mut self) {
        let sb = afs::superblock(self.dev);
        let cache = block_cache::get(self.dev, sb.inode_block(self.inum) as usize);
        let mut guard = cache.lock();
        guard.modify(SuperBlock::inode_offset(self.inum), |d: &mut DiskInode| {
            *d = self.dinode;
        });
        guard.sync();
    }

    /// Physical block currently mapped at logical block `bn`, without
    /// allocating
    pub fn map_block(&self, bn: usize) -> Option<u32> {
        self.locate(bn).map(|(phys, _)| phys)
    }

    /// Resolve `bn` to its physical block and stored checksum, without
    /// allocating
    fn locate(&self, bn: usize) -> Option<(u32, u32)> {
        match tier_of(bn) {
            Tier::Direct(i) => {
                let phys = self.dinode.addrs[i];
                (phys != 0).then(|| (phys, self.dinode.checksum[i]))
            }
            Tier::Single(j) => {
                let root = self.dinode.addrs[SINGLE_ROOT];
                if root == 0 {
                    return None;
                }
                read_pair(self.dev, root, j)
            }
            Tier::Double(i, j) => {
                let root = self.dinode.addrs[DOUBLE_ROOT];
                if root == 0 {
                    return None;
                }
                let inner = block_cache::get(self.dev, root as usize)
                    .lock()
                    .read(0, |ind: &IndirectBlock| ind[i]);
                if inner == 0 {
                    return None;
                }
                read_pair(self.dev, inner, j)
            }
        }
    }

    /// Resolve `bn` to its physical block, allocating the slot and any
    /// intermediate indirect blocks on first touch. `None` means the
    /// device ran out of blocks.
    fn map_or_alloc(&mut self, bn: usize) -> Option<u32> {
        match tier_of(bn) {
            Tier::Direct(i) => {
                if self.dinode.addrs[i] == 0 {
                    self.dinode.addrs[i] = bitmap::balloc(self.dev)?;
                }
                Some(self.dinode.addrs[i])
            }
            Tier::Single(j) => {
                let root = self.root_or_alloc(SINGLE_ROOT)?;
                slot_or_alloc(self.dev, root, j)
            }
            Tier::Double(i, j) => {
                let root = self.root_or_alloc(DOUBLE_ROOT)?;
                let inner = slot_or_alloc(self.dev, root, i)?;
                slot_or_alloc(self.dev, inner, j)
            }
        }
    }

    fn root_or_alloc(&mut self, slot: usize) -> Option<u32> {
        if self.dinode.addrs[slot] == 0 {
            self.dinode.addrs[slot] = bitmap::balloc(self.dev)?;
        }
        Some(self.dinode.addrs[slot])
    }

    /// Record the checksum of logical block `bn` in its tier slot
    fn store_checksum(&mut self, bn: usize, sum: u32) {
        match tier_of(bn) {
            Tier::Direct(i) => self.dinode.checksum[i] = sum,
            Tier::Single(j) => {
                write_pair(self.dev, self.dinode.addrs[SINGLE_ROOT], j, sum);
            }
            Tier::Double(i, j) => {
                let inner = block_cache::get(self.dev, self.dinode.addrs[DOUBLE_ROOT] as usize)
                    .lock()
                    .read(0, |ind: &IndirectBlock| ind[i]);
                write_pair(self.dev, inner, j, sum);
            }
        }
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Device inodes dispatch to their registered major. Reads are
    /// clamped at end of file; every touched block is verified against
    /// its stored Adler-32 before any of its bytes are copied out.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.dinode.is_device() {
            return dev::read(self.dinode.major, self.dinode.minor, buf);
        }
        let size = self.dinode.size as usize;
        if offset > size {
            return Err(FsError::BadOffset);
        }
        let end = offset
            .checked_add(buf.len())
            .ok_or(FsError::BadOffset)?
            .min(size);

        let mut start = offset;
        let mut read_size = 0usize;
        while start < end {
            let bn = start / BLOCK_SIZE;
            let cur_end = ((bn + 1) * BLOCK_SIZE).min(end);
            let n = cur_end - start;
            let (phys, expected) = self
                .locate(bn)
                .expect("read_at: unmapped block inside file size");
            let cache = block_cache::get(self.dev, phys as usize);
            let verified = cache.lock().read(0, |data: &DataBlock| {
                if adler32_slice(data) != expected {
                    return false;
                }
                let at = start % BLOCK_SIZE;
                buf[read_size..read_size + n].copy_from_slice(&data[at..at + n]);
                true
            });
            if !verified {
                error!("checksum mismatch, block {bn}");
                return Err(FsError::ChecksumMismatch { block: bn as u32 });
            }
            read_size += n;
            start = cur_end;
        }
        Ok(read_size)
    }

    /// Write `buf` starting at `offset`, growing the file as needed.
    ///
    /// Device inodes dispatch to their registered major. Writing may
    /// not leave a hole (`offset` beyond end of file fails) and is
    /// clamped to the largest expressible file; running out of data
    /// blocks ends the write early with the byte count so far. Every
    /// written block gets its Adler-32 recomputed and stored alongside
    /// its pointer, and the inode itself is persisted once the write
    /// moved any bytes.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if self.dinode.is_device() {
            return dev::write(self.dinode.major, self.dinode.minor, buf);
        }
        let size = self.dinode.size as usize;
        if offset > size {
            return Err(FsError::BadOffset);
        }
        let end = offset
            .checked_add(buf.len())
            .ok_or(FsError::BadOffset)?
            .min(MAXFILE * BLOCK_SIZE);

        let mut start = offset;
        let mut written = 0usize;
        while start < end {
            let bn = start / BLOCK_SIZE;
            let cur_end = ((bn + 1) * BLOCK_SIZE).min(end);
            let n = cur_end - start;
            let Some(phys) = self.map_or_alloc(bn) else {
                break;
            };
            let cache = block_cache::get(self.dev, phys as usize);
            let mut guard = cache.lock();
            let sum = guard.modify(0, |data: &mut DataBlock| {
                let at = start % BLOCK_SIZE;
                data[at..at + n].copy_from_slice(&buf[written..written + n]);
                adler32_slice(data)
            });
            guard.sync();
            drop(guard);
            self.store_checksum(bn, sum);
            written += n;
            start = cur_end;
        }

        if written > 0 {
            if offset + written > size {
                self.dinode.size = (offset + written) as u32;
            }
            self.update();
        }
        Ok(written)
    }

    /// Free every data and indirect block, reset the block map and the
    /// checksums, and persist the emptied inode
    pub fn truncate(&mut self) {
        let dev = self.dev;
        for i in 0..NDIRECT {
            if self.dinode.addrs[i] != 0 {
                bitmap::bfree(dev, self.dinode.addrs[i]);
                self.dinode.addrs[i] = 0;
            }
        }

        let single = self.dinode.addrs[SINGLE_ROOT];
        if single != 0 {
            free_indirect(dev, single);
            bitmap::bfree(dev, single);
            self.dinode.addrs[SINGLE_ROOT] = 0;
        }

        let double = self.dinode.addrs[DOUBLE_ROOT];
        if double != 0 {
            let inners = block_cache::get(dev, double as usize)
                .lock()
                .read(0, |ind: &IndirectBlock| *ind);
            for &inner in inners.iter().filter(|&&p| p != 0) {
                free_indirect(dev, inner);
                bitmap::bfree(dev, inner);
            }
            bitmap::bfree(dev, double);
            self.dinode.addrs[DOUBLE_ROOT] = 0;
        }

        self.dinode.size = 0;
        self.dinode.checksum = [0; NDIRECT];
        self.update();
    }

    /// Metadata snapshot, with every stored per-block checksum folded
    /// into one word by XOR
    pub fn stat(&self) -> Stat {
        let mut checksum = 0u32;
        for &sum in &self.dinode.checksum {
            checksum ^= sum;
        }

        let single = self.dinode.addrs[SINGLE_ROOT];
        if single != 0 {
            checksum ^= fold_indirect(self.dev, single);
        }
        let double = self.dinode.addrs[DOUBLE_ROOT];
        if double != 0 {
            let inners = block_cache::get(self.dev, double as usize)
                .lock()
                .read(0, |ind: &IndirectBlock| *ind);
            for &inner in inners.iter().filter(|&&p| p != 0) {
                checksum ^= fold_indirect(self.dev, inner);
            }
        }

        Stat {
            dev: self.dev,
            ino: self.inum,
            kind: self.dinode.kind,
            nlink: self.dinode.nlink,
            size: self.dinode.size,
            checksum,
        }
    }

    /// Find a directory entry by name and return an unlocked reference
    /// to its inode. Vacant entries are skipped; the comparison is
    /// bounded by the on-disk name length. A directory block failing
    /// its checksum reads as no match; the mismatch is already logged.
    pub fn dir_lookup(&self, name: &str) -> Option<Inode> {
        assert!(self.dinode.is_dir(), "dir_lookup: not a directory");
        let mut entry = DirEntry::empty();
        for offset in (0..self.dinode.size as usize).step_by(DIRENT_SIZE) {
            let n = match self.read_at(offset, entry.as_mut_bytes()) {
                Ok(n) => n,
                Err(FsError::ChecksumMismatch { .. }) => return None,
                Err(err) => panic!("dir_lookup: {err}"),
            };
            assert_eq!(n, DIRENT_SIZE, "dir_lookup: short dirent read");
            if entry.inum == 0 {
                continue;
            }
            if entry.name_matches(name) {
                return Some(iget(self.dev, u32::from(entry.inum)));
            }
        }
        None
    }

    /// Add the entry `(name, inum)` to this directory, reusing the
    /// first vacant slot or appending past the end. Fails when the name
    /// is already present or when a directory block fails its checksum.
    pub fn dir_link(&mut self, name: &str, inum: u32) -> Result<(), FsError> {
        if self.dir_lookup(name).is_some() {
            return Err(FsError::Exists);
        }

        let size = self.dinode.size as usize;
        let mut entry = DirEntry::empty();
        let mut offset = 0;
        while offset < size {
            let n = match self.read_at(offset, entry.as_mut_bytes()) {
                Ok(n) => n,
                Err(err @ FsError::ChecksumMismatch { .. }) => return Err(err),
                Err(err) => panic!("dir_link: {err}"),
            };
            assert_eq!(n, DIRENT_SIZE, "dir_link: short dirent read");
            if entry.inum == 0 {
                break;
            }
            offset += DIRENT_SIZE;
        }

        let entry = DirEntry::new(name, inum as u16);
        let n = self
            .write_at(offset, entry.as_bytes())
            .expect("dir_link: unwritable directory");
        assert_eq!(n, DIRENT_SIZE, "dir_link: short dirent write");
        Ok(())
    }
}

/// Pointer and paired checksum at slot `j` of an indirect block
fn read_pair(dev: u32, indirect: u32, j: usize) -> Option<(u32, u32)> {
    block_cache::get(dev, indirect as usize)
        .lock()
        .read(0, |ind: &IndirectBlock| {
            let phys = ind[j];
            (phys != 0).then(|| (phys, ind[paired_checksum(j)]))
        })
}

/// Store `sum` at the checksum slot paired with pointer `j`
fn write_pair(dev: u32, indirect: u32, j: usize, sum: u32) {
    assert!(indirect != 0, "write_pair: unmapped indirect block");
    let cache = block_cache::get(dev, indirect as usize);
    let mut guard = cache.lock();
    guard.modify(0, |ind: &mut IndirectBlock| {
        ind[paired_checksum(j)] = sum;
    });
    guard.sync();
}

/// Claim slot `j` of an indirect block, allocating a block for it on
/// first touch and writing the indirect block back
fn slot_or_alloc(dev: u32, indirect: u32, j: usize) -> Option<u32> {
    let cache = block_cache::get(dev, indirect as usize);
    let mut guard = cache.lock();
    let existing = guard.read(0, |ind: &IndirectBlock| ind[j]);
    if existing != 0 {
        return Some(existing);
    }
    let fresh = bitmap::balloc(dev)?;
    guard.modify(0, |ind: &mut IndirectBlock| ind[j] = fresh);
    guard.sync();
    Some(fresh)
}

/// Free every data block referenced by the pointer half of an indirect
/// block; the indirect block itself stays allocated
fn free_indirect(dev: u32, indirect: u32) {
    let pointers = block_cache::get(dev, indirect as usize)
        .lock()
        .read(0, |ind: &IndirectBlock| *ind);
    for &phys in pointers[..INDIRECT_COUNT].iter().filter(|&&p| p != 0) {
        bitmap::bfree(dev, phys);
    }
}

/// XOR of the paired checksums of every live pointer of an indirect
/// block
fn fold_indirect(dev: u32, indirect: u32) -> u32 {
    block_cache::get(dev, indirect as usize)
        .lock()
        .read(0, |ind: &IndirectBlock| {
            let mut sum = 0;
            for j in 0..INDIRECT_COUNT {
                if ind[j] != 0 {
                    sum ^= ind[paired_checksum(j)];
                }
            }
            sum
        })
}
