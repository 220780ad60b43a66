use block_file::BlockFile;

use adler_fs::{
    attach, ialloc, iinit, mkfs, namei, root_inode, Inode, InodeKind, BLOCK_SIZE, ROOT_DEV,
};
use clap::{Parser, Subcommand};
use std::fs::{read_dir, File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

mod block_file;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a fresh image and pack the files of a directory into it
    Pack {
        #[arg(short, long)]
        source: String,

        #[arg(short, long)]
        target: String,
    },
    /// Print the metadata of a path inside an image
    Stat {
        #[arg(short, long)]
        image: String,

        path: String,
    },
}

// 16 MiB, at most 1023 files
const IMAGE_BLOCKS: u32 = 16 * 2048;
const IMAGE_INODES: u32 = 1024;

fn open_image(path: &Path, fresh: bool) -> std::io::Result<Arc<BlockFile>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(fresh)
        .truncate(fresh)
        .open(path)?;
    if fresh {
        file.set_len(u64::from(IMAGE_BLOCKS) * BLOCK_SIZE as u64)?;
    }
    Ok(Arc::new(BlockFile(Mutex::new(file))))
}

/// Allocate an inode with one link and enter it under `parent`
fn create(parent: &Inode, name: &str, kind: InodeKind, major: i16, minor: i16) -> Inode {
    let inode = ialloc(parent.dev(), kind, major, minor);
    let mut guard = inode.lock();
    guard.set_nlink(1);
    guard.update();
    drop(guard);
    parent
        .lock()
        .dir_link(name, inode.inum())
        .expect("create: name exists");
    inode
}

fn pack(source: &str, target: &str) -> std::io::Result<()> {
    let image_path = Path::new(target).join("fs.img");

    println!("Initializing the adler-fs image...");
    let block_file = open_image(&image_path, true)?;
    attach(ROOT_DEV, block_file);
    mkfs(ROOT_DEV, IMAGE_BLOCKS, IMAGE_INODES);
    let root = root_inode(ROOT_DEV);

    println!("Packing files from {source:?} into the adler-fs image...");
    for entry in read_dir(source)? {
        let path = entry?.path();
        if path.is_file() {
            let name = path.file_name().unwrap().to_str().unwrap();
            println!("Processing file: {}", path.display());

            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;

            let inode = create(&root, name, InodeKind::File, 0, 0);
            let written = inode.lock().write_at(0, &data).expect("image write failed");
            assert_eq!(written, data.len(), "image out of space");
        }
    }
    adler_fs::sync_all();

    println!("The adler-fs image has been saved to: {}", image_path.display());
    Ok(())
}

fn stat(image: &str, path: &str) -> std::io::Result<()> {
    let block_file = open_image(Path::new(image), false)?;
    attach(ROOT_DEV, block_file);
    iinit(ROOT_DEV);
    let root = root_inode(ROOT_DEV);

    let Some(inode) = namei(path, &root) else {
        eprintln!("stat: cannot resolve {path}");
        std::process::exit(1);
    };
    let st = inode.lock().stat();
    println!("type: {}", st.kind as i16);
    println!("dev: {}", st.dev);
    println!("ino: {}", st.ino);
    println!("nlink: {}", st.nlink);
    println!("size: {}", st.size);
    println!("checksum: {:x}", st.checksum);
    Ok(())
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Pack { source, target } => pack(&source, &target),
        Command::Stat { image, path } => stat(&image, &path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adler::adler32_slice;
    use adler_fs::{
        flush, nameiparent, register_device, skip_elem, BlockDevice, CharDevice, FsError, MAXFILE,
        NDIRECT,
    };

    fn test_image(name: &str, blocks: u32) -> Arc<BlockFile> {
        let path = std::env::temp_dir().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        file.set_len(u64::from(blocks) * BLOCK_SIZE as u64).unwrap();
        Arc::new(BlockFile(Mutex::new(file)))
    }

    fn setup(dev: u32, name: &str, blocks: u32, ninodes: u32) -> Arc<BlockFile> {
        let file = test_image(name, blocks);
        attach(dev, file.clone());
        mkfs(dev, blocks, ninodes);
        file
    }

    /// Population of the free bitmap, read raw from the device
    fn used_blocks(file: &BlockFile, total: u32, ninodes: u32) -> u32 {
        let inode_area = (ninodes + adler_fs::IPB as u32 - 1) / adler_fs::IPB as u32;
        let bitmap_start = 2 + inode_area;
        let bits_per_block = (BLOCK_SIZE * 8) as u32;
        let bitmap_blocks = (total + bits_per_block - 1) / bits_per_block;
        let mut buf = [0u8; BLOCK_SIZE];
        let mut used = 0;
        for i in 0..bitmap_blocks {
            file.read_block((bitmap_start + i) as usize, &mut buf);
            used += buf.iter().map(|byte| byte.count_ones()).sum::<u32>();
        }
        used
    }

    #[test]
    fn fs_test() {
        setup(ROOT_DEV, "adler-fs-test-root.img", 4096, 256);
        iinit(ROOT_DEV);
        let root = root_inode(ROOT_DEV);

        // a small file, its content checksum visible through stat
        let a = create(&root, "a", InodeKind::File, 0, 0);
        assert_eq!(a.lock().write_at(0, b"hello"), Ok(5));
        let st = a.lock().stat();
        assert_eq!(st.size, 5);
        assert_eq!(st.kind, InodeKind::File);
        assert_eq!(st.nlink, 1);
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..5].copy_from_slice(b"hello");
        assert_eq!(st.checksum, adler32_slice(&padded));
        // stat is stable without intervening writes
        assert_eq!(a.lock().stat().checksum, st.checksum);

        let mut buf = [0u8; 16];
        assert_eq!(a.lock().read_at(0, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");

        // appending at the end extends, writing past it does not
        assert_eq!(a.lock().write_at(5, b" world"), Ok(6));
        assert_eq!(a.lock().write_at(100, b"x"), Err(FsError::BadOffset));
        assert_eq!(a.lock().size(), 11);
        assert_eq!(a.lock().read_at(11, &mut buf), Ok(0));
        assert_eq!(a.lock().read_at(12, &mut buf), Err(FsError::BadOffset));

        // directory scan: hit, near miss, duplicate
        let d = create(&root, "d", InodeKind::Directory, 0, 0);
        let _da = create(&d, "a", InodeKind::File, 0, 0);
        let db = create(&d, "bb", InodeKind::File, 0, 0);
        let _dc = create(&d, "c", InodeKind::File, 0, 0);
        let found = d.lock().dir_lookup("bb").unwrap();
        assert_eq!(found.inum(), db.inum());
        assert!(d.lock().dir_lookup("bbb").is_none());
        assert_eq!(root.lock().dir_link("a", a.inum()), Err(FsError::Exists));

        // names compare over their first NAME_LENGTH bytes only
        let long = create(&root, "abcdefghijklmn", InodeKind::File, 0, 0);
        let hit = root.lock().dir_lookup("abcdefghijklmnopq").unwrap();
        assert_eq!(hit.inum(), long.inum());

        // path walking, absolute and relative to a directory
        let x = create(&root, "x", InodeKind::Directory, 0, 0);
        let y = create(&x, "y", InodeKind::Directory, 0, 0);
        let z = create(&y, "z", InodeKind::File, 0, 0);
        let absolute = namei("/x/y/z", &root).unwrap();
        let relative = namei("y/z", &x).unwrap();
        assert_eq!(absolute.inum(), z.inum());
        assert_eq!(relative.inum(), z.inum());
        let (parent, name) = nameiparent("/x/y/z", &root).unwrap();
        assert_eq!(parent.inum(), y.inum());
        assert_eq!(name, "z");
        assert!(namei("/x/missing", &root).is_none());
        assert!(namei("/x/y/z/deeper", &root).is_none());
        assert!(nameiparent("/", &root).is_none());
    }

    #[test]
    fn checksum_detects_corruption() {
        let file = setup(3, "adler-fs-test-corrupt.img", 4096, 64);
        let root = root_inode(3);
        let b = create(&root, "b", InodeKind::File, 0, 0);
        let data = [0xAAu8; 13 * BLOCK_SIZE];
        assert_eq!(b.lock().write_at(0, &data), Ok(data.len()));

        // flip one byte of logical block 5 behind the cache's back
        let phys = b.lock().map_block(5).unwrap();
        flush();
        let mut block = [0u8; BLOCK_SIZE];
        file.read_block(phys as usize, &mut block);
        block[77] ^= 0x01;
        file.write_block(phys as usize, &block);

        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(b.lock().read_at(0, &mut buf), Ok(BLOCK_SIZE));
        assert_eq!(
            b.lock().read_at(5 * BLOCK_SIZE, &mut buf),
            Err(FsError::ChecksumMismatch { block: 5 })
        );
    }

    #[test]
    fn indirect_growth_and_truncate() {
        let file = setup(4, "adler-fs-test-indirect.img", 8192, 64);
        let root = root_inode(4);
        let c = create(&root, "c", InodeKind::File, 0, 0);
        flush();
        let before = used_blocks(&file, 8192, 64);

        let blocks = NDIRECT + 64;
        let mut pattern = vec![0u8; blocks * BLOCK_SIZE];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        assert_eq!(c.lock().write_at(0, &pattern), Ok(pattern.len()));
        let mut back = vec![0u8; pattern.len()];
        assert_eq!(c.lock().read_at(0, &mut back), Ok(pattern.len()));
        assert_eq!(back, pattern);
        flush();
        assert!(used_blocks(&file, 8192, 64) > before);

        c.lock().truncate();
        let st = c.lock().stat();
        assert_eq!(st.size, 0);
        assert_eq!(st.checksum, 0);
        for bn in 0..blocks {
            assert!(c.lock().map_block(bn).is_none());
        }
        flush();
        assert_eq!(used_blocks(&file, 8192, 64), before);
    }

    #[test]
    fn concurrent_disjoint_writes() {
        setup(5, "adler-fs-test-concurrent.img", 8192, 64);
        let root = root_inode(5);
        let f = create(&root, "f", InodeKind::File, 0, 0);
        let g = create(&root, "g", InodeKind::File, 0, 0);

        let writer = |inode: Inode, byte: u8| {
            move || {
                let data = vec![byte; 64 * BLOCK_SIZE];
                assert_eq!(inode.lock().write_at(0, &data), Ok(data.len()));
            }
        };
        let t1 = std::thread::spawn(writer(f.clone(), 0x11));
        let t2 = std::thread::spawn(writer(g.clone(), 0x22));
        t1.join().unwrap();
        t2.join().unwrap();

        let mut buf = vec![0u8; 64 * BLOCK_SIZE];
        assert_eq!(f.lock().read_at(0, &mut buf), Ok(buf.len()));
        assert!(buf.iter().all(|&b| b == 0x11));
        assert_eq!(g.lock().read_at(0, &mut buf), Ok(buf.len()));
        assert!(buf.iter().all(|&b| b == 0x22));
    }

    #[test]
    fn maxfile_clamp() {
        setup(6, "adler-fs-test-maxfile.img", 16 * 2048, 64);
        let root = root_inode(6);
        let big = create(&root, "big", InodeKind::File, 0, 0);

        let cap = MAXFILE * BLOCK_SIZE;
        let chunk = vec![0x5Au8; 256 * BLOCK_SIZE];
        let mut offset = 0;
        while offset < cap - 256 {
            let n = chunk.len().min(cap - 256 - offset);
            assert_eq!(big.lock().write_at(offset, &chunk[..n]), Ok(n));
            offset += n;
        }
        // the tail write crosses the largest expressible size: clamped
        assert_eq!(big.lock().write_at(offset, &chunk[..512]), Ok(256));
        assert_eq!(big.lock().size() as usize, cap);

        // the double-indirect region reads back intact
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(big.lock().read_at(8000 * BLOCK_SIZE, &mut buf), Ok(BLOCK_SIZE));
        assert!(buf.iter().all(|&b| b == 0x5A));
        assert_eq!(big.lock().read_at(cap - BLOCK_SIZE, &mut buf), Ok(BLOCK_SIZE));
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn exhaustion_ends_write_short() {
        setup(7, "adler-fs-test-small.img", 64, 8);
        let root = root_inode(7);
        let f = create(&root, "f", InodeKind::File, 0, 0);

        let data = vec![9u8; 128 * BLOCK_SIZE];
        let written = f.lock().write_at(0, &data).unwrap();
        assert!(written > 0);
        assert!(written < data.len());
        assert_eq!(written % BLOCK_SIZE, 0);
        assert_eq!(f.lock().size() as usize, written);

        // everything that fit stays readable
        let mut buf = vec![0u8; written];
        assert_eq!(f.lock().read_at(0, &mut buf), Ok(written));
        assert!(buf.iter().all(|&b| b == 9));
    }

    fn fill_read(_minor: i16, buf: &mut [u8]) -> Result<usize, FsError> {
        buf.fill(0x5A);
        Ok(buf.len())
    }

    fn sink_write(_minor: i16, buf: &[u8]) -> Result<usize, FsError> {
        Ok(buf.len())
    }

    #[test]
    fn device_inodes_dispatch_by_major() {
        setup(8, "adler-fs-test-dev.img", 1024, 16);
        let root = root_inode(8);
        register_device(
            2,
            CharDevice {
                read: fill_read,
                write: sink_write,
            },
        );

        let tty = create(&root, "tty", InodeKind::Device, 2, 0);
        let mut buf = [0u8; 8];
        assert_eq!(tty.lock().read_at(0, &mut buf), Ok(8));
        assert!(buf.iter().all(|&b| b == 0x5A));
        assert_eq!(tty.lock().write_at(0, &buf), Ok(8));

        let nodev = create(&root, "nodev", InodeKind::Device, 7, 0);
        assert_eq!(nodev.lock().read_at(0, &mut buf), Err(FsError::BadMajor));
    }

    #[test]
    fn unlinked_inode_freed_on_last_put() {
        let file = setup(9, "adler-fs-test-unlink.img", 1024, 16);

        let f = ialloc(9, InodeKind::File, 0, 0);
        let inum = f.inum();
        assert_eq!(f.lock().write_at(0, &[7u8; 3 * BLOCK_SIZE]), Ok(3 * BLOCK_SIZE));
        flush();
        let before = used_blocks(&file, 1024, 16);

        // last reference to a link-less inode frees its blocks and slot
        drop(f);
        flush();
        assert_eq!(used_blocks(&file, 1024, 16), before - 3);
        let again = ialloc(9, InodeKind::File, 0, 0);
        assert_eq!(again.inum(), inum);
    }

    #[test]
    fn random_round_trips() {
        setup(2, "adler-fs-test-random.img", 8192, 16);
        let root = root_inode(2);
        let f = create(&root, "filea", InodeKind::File, 0, 0);

        let random_test = |len: usize| {
            f.lock().truncate();
            let data: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
            assert_eq!(f.lock().write_at(0, &data), Ok(len));

            let mut read_buffer = [0u8; 127];
            let mut offset = 0usize;
            let mut back = Vec::new();
            loop {
                let n = f.lock().read_at(offset, &mut read_buffer).unwrap();
                if n == 0 {
                    break;
                }
                offset += n;
                back.extend_from_slice(&read_buffer[..n]);
            }
            assert_eq!(data, back);
        };

        random_test(4 * BLOCK_SIZE);
        random_test(8 * BLOCK_SIZE + BLOCK_SIZE / 2);
        random_test(100 * BLOCK_SIZE);
        random_test(70 * BLOCK_SIZE + BLOCK_SIZE / 7);
        random_test((12 + 128) * BLOCK_SIZE);
    }

    #[test]
    fn skip_elem_tokenizes() {
        assert_eq!(skip_elem("///a//bb"), Some(("a", "bb")));
        assert_eq!(skip_elem("a"), Some(("a", "")));
        assert_eq!(skip_elem("a/b/c"), Some(("a", "b/c")));
        assert_eq!(skip_elem("x//"), Some(("x", "")));
        assert_eq!(skip_elem(""), None);
        assert_eq!(skip_elem("////"), None);
    }
}
