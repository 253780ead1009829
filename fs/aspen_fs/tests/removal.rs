//! Removal semantics: unlink-while-open and exact resource release.

use aspen::fs::{Disk, MemDisk};
use aspen_fs::{AspenFs, KernelError};

fn fresh(sectors: usize) -> AspenFs {
    AspenFs::format(Disk::new(MemDisk::new(sectors))).unwrap()
}

#[test]
fn removed_file_stays_readable_through_open_handles() {
    let fs = fresh(1024);
    fs.create(None, "/a", 3000).unwrap();
    let mut f = fs.open(None, "/a").unwrap().into_file(&fs).unwrap();
    let payload = *b"still reachable";
    assert_eq!(f.write_at(&fs, &payload, 100), payload.len());

    let free_before_remove = fs.free_sectors();
    fs.remove(None, "/a").expect("removing `/a' must succeed");

    assert!(
        matches!(fs.open(None, "/a"), Err(KernelError::NoSuchEntry)),
        "`/a' must be unreachable by name after the remove"
    );
    // Sectors are not reclaimed while a handle is open.
    assert_eq!(fs.free_sectors(), free_before_remove);

    let mut back = [0u8; 15];
    assert_eq!(f.read_at(&fs, &mut back, 100), back.len());
    assert_eq!(back, payload);

    // 3000 bytes of data in 6 direct sectors, plus the inode sector.
    f.close(&fs);
    assert_eq!(fs.free_sectors(), free_before_remove + 7);
    fs.unmount();
}

#[test]
fn the_name_is_reusable_while_the_old_file_lives_on() {
    let fs = fresh(1024);
    fs.create(None, "/a", 512).unwrap();
    let f = fs.open(None, "/a").unwrap().into_file(&fs).unwrap();
    let old = *b"old contents";
    assert_eq!(f.write_at(&fs, &old, 0), old.len());

    fs.remove(None, "/a").unwrap();
    fs.create(None, "/a", 512)
        .expect("the removed name must be free for reuse");
    let g = fs.open(None, "/a").unwrap().into_file(&fs).unwrap();
    assert_ne!(f.inumber(), g.inumber());

    // The two files are independent.
    let mut back = [0u8; 12];
    assert_eq!(f.read_at(&fs, &mut back, 0), back.len());
    assert_eq!(back, old);
    assert_eq!(g.read_at(&fs, &mut back, 0), back.len());
    assert_eq!(back, [0u8; 12]);

    f.close(&fs);
    g.close(&fs);
    fs.unmount();
}

#[test]
fn a_full_lifecycle_returns_every_sector() {
    let fs = fresh(2048);
    let before = fs.free_sectors();

    // Large enough to need indirect blocks: 100_000 bytes is 196 data
    // sectors, 10 direct plus two indirect groups.
    fs.create(None, "/big", 100_000).unwrap();
    assert!(fs.free_sectors() < before);
    let f = fs.open(None, "/big").unwrap().into_file(&fs).unwrap();
    fs.remove(None, "/big").unwrap();
    f.close(&fs);

    assert_eq!(
        fs.free_sectors(),
        before,
        "remove + last close must release the file's whole footprint"
    );
    fs.unmount();
}

#[test]
fn double_indirect_files_release_their_index_blocks_too() {
    let fs = fresh(4096);
    let before = fs.free_sectors();

    fs.create(None, "/deep", 0).unwrap();
    let f = fs.open(None, "/deep").unwrap().into_file(&fs).unwrap();
    let off = (10 + 10 * 128 + 200) * 512;
    assert_eq!(f.write_at(&fs, &[9], off), 1);
    fs.remove(None, "/deep").unwrap();
    f.close(&fs);

    assert_eq!(fs.free_sectors(), before);
    fs.unmount();
}

#[test]
fn open_counts_are_balanced() {
    let fs = fresh(512);
    fs.create(None, "/shared", 0).unwrap();
    let a = fs.open(None, "/shared").unwrap().into_file(&fs).unwrap();
    let b = fs.open(None, "/shared").unwrap().into_file(&fs).unwrap();
    assert_eq!(a.inode().open_count(), 2);
    assert_eq!(a.inumber(), b.inumber());
    b.close(&fs);
    assert_eq!(a.inode().open_count(), 1);
    a.close(&fs);
    fs.unmount();
}
