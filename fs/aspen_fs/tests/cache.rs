//! Write-back durability: flush, remount, and the background sweep.

use aspen::fs::{Disk, MemDisk, SECTOR_SIZE};
use aspen_fs::{AspenFs, MAX_CACHE_SIZE};
use rand::{Rng, SeedableRng, rngs::StdRng};

#[test]
fn flush_round_trips_bytes_exactly() {
    let disk = Disk::new(MemDisk::new(1024));
    let fs = AspenFs::format(disk).unwrap();

    let mut pattern = vec![0u8; 4096];
    let mut rng = StdRng::seed_from_u64(0x5eed);
    rng.fill(pattern.as_mut_slice());

    fs.create(None, "/p", 0).unwrap();
    let f = fs.open(None, "/p").unwrap().into_file(&fs).unwrap();
    assert_eq!(f.write_at(&fs, &pattern, 0), pattern.len());
    fs.flush();

    let mut back = vec![0u8; 4096];
    assert_eq!(f.read_at(&fs, &mut back, 0), back.len());
    assert_eq!(back, pattern, "flushed bytes must round-trip exactly");

    f.close(&fs);
    fs.unmount();
}

#[test]
fn contents_survive_a_remount() {
    let disk = Disk::new(MemDisk::new(2048));
    let fs = AspenFs::format(disk.clone()).unwrap();

    let mut pattern = vec![0u8; 64 * 1024];
    let mut rng = StdRng::seed_from_u64(42);
    rng.fill(pattern.as_mut_slice());

    fs.create(None, "/keep", 0).unwrap();
    let f = fs.open(None, "/keep").unwrap().into_file(&fs).unwrap();
    assert_eq!(f.write_at(&fs, &pattern, 0), pattern.len());
    f.close(&fs);
    let free_before = fs.free_sectors();
    fs.unmount();

    // A fresh cache pool over the same device.
    let fs = AspenFs::mount(disk).unwrap();
    assert_eq!(
        fs.free_sectors(),
        free_before,
        "the free map must survive the remount"
    );
    let f = fs.open(None, "/keep").unwrap().into_file(&fs).unwrap();
    assert_eq!(f.length(), pattern.len());
    let mut back = vec![0u8; pattern.len()];
    assert_eq!(f.read_at(&fs, &mut back, 0), back.len());
    assert_eq!(back, pattern, "remounted bytes must match bit-exactly");
    f.close(&fs);
    fs.unmount();
}

#[test]
fn directories_survive_a_remount() {
    let disk = Disk::new(MemDisk::new(1024));
    let fs = AspenFs::format(disk.clone()).unwrap();
    fs.mkdir(None, "/d").unwrap();
    fs.mkdir(None, "/d/e").unwrap();
    fs.create(None, "/d/e/f", 123).unwrap();
    fs.unmount();

    let fs = AspenFs::mount(disk).unwrap();
    let f = fs.open(None, "/d/e/f").unwrap().into_file(&fs).unwrap();
    assert_eq!(f.length(), 123);
    f.close(&fs);
    fs.unmount();
}

#[test]
fn saturating_the_pool_keeps_data_intact() {
    // More distinct file sectors than cache entries, so reads near the end
    // evict buffers dirtied near the start.
    let disk = Disk::new(MemDisk::new(4096));
    let fs = AspenFs::format(disk).unwrap();

    let total = 3 * MAX_CACHE_SIZE * SECTOR_SIZE;
    let mut pattern = vec![0u8; total];
    let mut rng = StdRng::seed_from_u64(7);
    rng.fill(pattern.as_mut_slice());

    fs.create(None, "/wide", 0).unwrap();
    let f = fs.open(None, "/wide").unwrap().into_file(&fs).unwrap();
    assert_eq!(f.write_at(&fs, &pattern, 0), total);
    let mut back = vec![0u8; total];
    assert_eq!(f.read_at(&fs, &mut back, 0), total);
    assert_eq!(back, pattern);

    f.close(&fs);
    fs.unmount();
}

#[test]
fn the_flusher_writes_back_without_an_explicit_flush() {
    let disk = Disk::new(MemDisk::new(1024));
    let fs = AspenFs::format(disk.clone()).unwrap();
    fs.create(None, "/swept", 512).unwrap();
    let f = fs.open(None, "/swept").unwrap().into_file(&fs).unwrap();
    let payload = [0xabu8; SECTOR_SIZE];
    assert_eq!(f.write_at(&fs, &payload, 0), SECTOR_SIZE);
    let sector = f
        .inode()
        .byte_to_sector(&fs, 0)
        .expect("byte 0 must be mapped");

    // Wait out the sweep cadence; the device copy must catch up while the
    // mount stays live.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(sector, &mut raw).unwrap();
        if raw == payload {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "the background flusher never wrote the dirty buffer back"
        );
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    f.close(&fs);
    fs.unmount();
}

#[test]
fn recently_used_sectors_stay_cached_under_pressure() {
    let disk = Disk::new(MemDisk::new(4096));
    let fs = AspenFs::format(disk).unwrap();
    fs.create(None, "/hot", 2 * MAX_CACHE_SIZE * SECTOR_SIZE).unwrap();
    let f = fs.open(None, "/hot").unwrap().into_file(&fs).unwrap();

    let hot = f.inode().byte_to_sector(&fs, 0).unwrap();
    let mut buf = [0u8; SECTOR_SIZE];

    // Keep sector 0 hot while sweeping the rest of the file through the
    // pool; the cold sectors must be the ones evicted.
    for chunk in 1..2 * MAX_CACHE_SIZE {
        assert_eq!(f.read_at(&fs, &mut buf, chunk * SECTOR_SIZE), SECTOR_SIZE);
        if chunk % 8 == 0 {
            assert_eq!(f.read_at(&fs, &mut buf, 0), SECTOR_SIZE);
        }
    }
    assert!(
        fs.cached(hot),
        "a continually re-used sector must survive cache pressure"
    );

    f.close(&fs);
    fs.unmount();
}
