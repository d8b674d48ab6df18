//! Concurrent access: parallel handles, shared inodes, racing opens.

mod common;

use common::TempPool;
use pmfs::{FilePool, Whence};

const POOL_SIZE: u64 = 96 << 20;

/// Deterministic filler, distinct per stream.
fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn parallel_writers_to_distinct_files() {
    let path = TempPool::new("writers");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    std::thread::scope(|scope| {
        for t in 0..8u8 {
            let pool = &pool;
            scope.spawn(move || {
                let name = format!("/w{t}");
                let f = pool
                    .open_file(&name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
                    .unwrap();
                let chunk = pattern(t, 8000);
                for _ in 0..20 {
                    assert_eq!(pool.write(&f, &chunk).unwrap(), chunk.len());
                }
                pool.close_file(f);
            });
        }
    });

    for t in 0..8u8 {
        let f = pool.open_file(&format!("/w{t}"), libc::O_RDONLY, 0).unwrap();
        let chunk = pattern(t, 8000);
        let mut buf = vec![0u8; chunk.len()];
        for _ in 0..20 {
            assert_eq!(pool.read(&f, &mut buf).unwrap(), chunk.len());
            assert_eq!(buf, chunk);
        }
        assert_eq!(pool.read(&f, &mut buf).unwrap(), 0);
        pool.close_file(f);
    }
    pool.close();
}

#[test]
fn concurrent_readers_of_one_inode() {
    let path = TempPool::new("readers");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let data = pattern(3, 1 << 20);
    let f = pool
        .open_file("/shared", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, &data).unwrap(), data.len());
    pool.close_file(f);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let pool = &pool;
            let data = &data;
            scope.spawn(move || {
                // Every reader gets its own handle and offset.
                let f = pool.open_file("/shared", libc::O_RDONLY, 0).unwrap();
                let mut buf = vec![0u8; 64 * 1024];
                let mut off = 0usize;
                loop {
                    let n = pool.read(&f, &mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    assert_eq!(&buf[..n], &data[off..off + n]);
                    off += n;
                }
                assert_eq!(off, data.len());
                pool.close_file(f);
            });
        }
    });
    pool.close();
}

#[test]
fn racing_opens_share_one_runtime() {
    let path = TempPool::new("raceopen");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/target", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, b"racy").unwrap(), 4);
    pool.close_file(f);

    // Many threads open and close the same name; the runtime state must be
    // constructed once per wave and torn down cleanly every time.
    for _ in 0..10 {
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = &pool;
                scope.spawn(move || {
                    let f = pool.open_file("/target", libc::O_RDONLY, 0).unwrap();
                    let mut buf = [0u8; 8];
                    assert_eq!(pool.read(&f, &mut buf).unwrap(), 4);
                    assert_eq!(&buf[..4], b"racy");
                    pool.close_file(f);
                });
            }
        });
    }

    assert_eq!(pool.stats().inodes, 2);
    pool.close();
}

#[test]
fn writer_and_readers_interleave() {
    let path = TempPool::new("mixed");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/log", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    let record = pattern(9, 512);

    std::thread::scope(|scope| {
        let pool_ref = &pool;
        let record_ref = &record;
        let writer = scope.spawn(move || {
            for _ in 0..100 {
                assert_eq!(pool_ref.write(&f, record_ref).unwrap(), record_ref.len());
            }
            f
        });

        for _ in 0..4 {
            scope.spawn(move || {
                let f = pool_ref.open_file("/log", libc::O_RDONLY, 0).unwrap();
                let mut seen = 0u64;
                for _ in 0..50 {
                    // Sizes only grow, and only by whole records.
                    let size = pool_ref
                        .lseek(&f, 0, Whence::End)
                        .unwrap();
                    assert!(size >= seen);
                    assert_eq!(size % record_ref.len() as u64, 0);
                    seen = size;

                    // Whatever is visible is fully written.
                    if size > 0 {
                        pool_ref.lseek(&f, -(record_ref.len() as i64), Whence::End).unwrap();
                        let mut buf = vec![0u8; record_ref.len()];
                        assert_eq!(pool_ref.read(&f, &mut buf).unwrap(), record_ref.len());
                        assert_eq!(&buf, record_ref);
                    }
                }
                pool_ref.close_file(f);
            });
        }

        let f = writer.join().unwrap();
        pool.close_file(f);
    });

    pool.close();
}
