//! File growth across the index tiers.

use aspen::fs::{Disk, MemDisk};
use aspen_fs::{AspenFs, SECTOR_SIZE};

fn fresh(sectors: usize) -> AspenFs {
    AspenFs::format(Disk::new(MemDisk::new(sectors))).unwrap()
}

#[test]
fn grow_across_index_boundaries() {
    let fs = fresh(4096);
    fs.create(None, "/g", 0)
        .expect("creating `/g' must succeed");
    let mut f = fs
        .open(None, "/g")
        .unwrap()
        .into_file(&fs)
        .expect("`/g' must be a regular file");
    assert_eq!(f.length(), 0);

    // One byte at the end of the direct region.
    f.seek(10 * SECTOR_SIZE - 1);
    assert_eq!(f.write(&fs, &[0xaa]), 1);
    assert_eq!(f.length(), 10 * SECTOR_SIZE);

    // One byte past the first full indirect block engages indirect[1].
    let off_ib1 = (10 + 128) * SECTOR_SIZE;
    assert_eq!(f.write_at(&fs, &[0xbb], off_ib1), 1);
    assert_eq!(f.length(), off_ib1 + 1);

    // One byte past all ten indirect blocks engages the double-indirect
    // tree.
    let off_dbl = (10 + 10 * 128) * SECTOR_SIZE;
    assert_eq!(f.write_at(&fs, &[0xcc], off_dbl), 1);
    assert_eq!(f.length(), off_dbl + 1);

    // The written bytes read back, everything between them reads zero.
    let mut byte = [0u8; 1];
    assert_eq!(f.read_at(&fs, &mut byte, 10 * SECTOR_SIZE - 1), 1);
    assert_eq!(byte[0], 0xaa);
    assert_eq!(f.read_at(&fs, &mut byte, off_ib1), 1);
    assert_eq!(byte[0], 0xbb);
    assert_eq!(f.read_at(&fs, &mut byte, off_dbl), 1);
    assert_eq!(byte[0], 0xcc);
    for probe in [0, 2560, 5120, 70_144] {
        assert_eq!(f.read_at(&fs, &mut byte, probe), 1);
        assert_eq!(byte[0], 0, "offset {probe} must read back zero");
    }

    f.close(&fs);
    fs.unmount();
}

#[test]
fn every_readable_offset_is_backed_by_an_allocated_sector() {
    let fs = fresh(4096);
    fs.create(None, "/backed", 0).unwrap();
    let f = fs.open(None, "/backed").unwrap().into_file(&fs).unwrap();
    let end = (10 + 10 * 128 + 3) * SECTOR_SIZE;
    assert_eq!(f.write_at(&fs, &[1], end - 1), 1);

    for pos in (0..f.length()).step_by(SECTOR_SIZE) {
        let sector = f
            .inode()
            .byte_to_sector(&fs, pos)
            .expect("offset below length must map to a sector");
        assert!(
            fs.freemap.is_allocated(sector),
            "offset {pos} maps to sector {} which the free map calls free",
            sector.into_usize()
        );
    }
    assert!(f.inode().byte_to_sector(&fs, f.length()).is_none());

    f.close(&fs);
    fs.unmount();
}

#[test]
fn writes_past_eof_leave_zero_filled_holes() {
    let fs = fresh(1024);
    fs.create(None, "/hole", 1000).unwrap();
    let f = fs.open(None, "/hole").unwrap().into_file(&fs).unwrap();

    let tail = *b"tail";
    assert_eq!(f.write_at(&fs, &tail, 9000), 4);
    assert_eq!(f.length(), 9004);

    // The skipped range reads back as zeros.
    let mut gap = vec![0xffu8; 8000];
    assert_eq!(f.read_at(&fs, &mut gap, 1000), 8000);
    assert!(gap.iter().all(|&b| b == 0), "hole bytes must read zero");

    let mut back = [0u8; 4];
    assert_eq!(f.read_at(&fs, &mut back, 9000), 4);
    assert_eq!(back, tail);

    // Reads past EOF come back short.
    let mut past = [0u8; 16];
    assert_eq!(f.read_at(&fs, &mut past, 9004), 0);
    assert_eq!(f.read_at(&fs, &mut past, 9000), 4);

    f.close(&fs);
    fs.unmount();
}

#[test]
fn growth_failure_is_a_short_write() {
    // Too few sectors to hold the requested growth.
    let fs = fresh(64);
    fs.create(None, "/cramped", 0).unwrap();
    let f = fs.open(None, "/cramped").unwrap().into_file(&fs).unwrap();
    let big = vec![7u8; 64 * SECTOR_SIZE];
    assert_eq!(f.write_at(&fs, &big, 0), 0, "growth must fail outright");
    assert_eq!(f.length(), 0, "a failed growth must not move the length");
    f.close(&fs);
    fs.unmount();
}
