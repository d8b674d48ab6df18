//! Read, write and seek behaviour, including sparse files and the
//! data-tracking configuration matrix.

mod common;

use common::TempPool;
use pmfs::{Config, Error, FilePool, Whence};

const POOL_SIZE: u64 = 96 << 20;

#[test]
fn read_write_seek() {
    let path = TempPool::new("rw");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/file1", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();

    let data = b"Marcin S\0";
    assert_eq!(pool.write(&f, data).unwrap(), data.len());

    // Write-only handle refuses reads.
    let mut buf = [0xffu8; 4096];
    assert!(matches!(pool.read(&f, &mut buf), Err(Error::BadFile)));
    pool.close_file(f);

    // Read it back; a read-only handle refuses writes and then hits EOF.
    let f = pool.open_file("/file1", libc::O_RDONLY, 0).unwrap();
    assert_eq!(pool.read(&f, &mut buf[..data.len()]).unwrap(), data.len());
    assert_eq!(&buf[..data.len()], data);
    assert!(matches!(pool.write(&f, data), Err(Error::BadFile)));
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 0);
    pool.close_file(f);

    // A short file answers a big read with a short count.
    let f = pool.open_file("/file1", libc::O_RDONLY, 0).unwrap();
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), data.len());
    assert_eq!(&buf[..data.len()], data);
    assert!(buf[data.len()..].iter().all(|&b| b == 0xff));
    pool.close_file(f);

    // Reads split across calls pick up where they left off.
    let f = pool.open_file("/file1", libc::O_RDONLY, 0).unwrap();
    assert_eq!(pool.read(&f, &mut buf[..5]).unwrap(), 5);
    assert_eq!(&buf[..5], &data[..5]);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf[..15]).unwrap(), 4);
    assert_eq!(&buf[..4], &data[5..9]);
    pool.close_file(f);

    // Overwrite the front, then read the rest from the shared offset.
    let f = pool.open_file("/file1", libc::O_RDWR, 0).unwrap();
    assert_eq!(pool.write(&f, b"pmem").unwrap(), 4);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], &data[4..9]);
    pool.close_file(f);

    let f = pool.open_file("/file1", libc::O_RDWR, 0).unwrap();
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 9);
    assert_eq!(&buf[..9], b"pmemin S\0");
    pool.close_file(f);

    // Seeks relative to current position and to the end.
    let f = pool.open_file("/file1", libc::O_RDWR, 0).unwrap();
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 0);

    assert_eq!(pool.lseek(&f, 3, Whence::Cur).unwrap(), 3);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"min S\0");
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 9);

    assert_eq!(pool.lseek(&f, -7, Whence::Cur).unwrap(), 2);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"emin S\0");
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 9);

    assert_eq!(pool.lseek(&f, -3, Whence::End).unwrap(), 6);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b" S\0");
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 9);

    // Negative targets are rejected and leave the offset alone.
    assert!(matches!(pool.lseek(&f, -1, Whence::Set), Err(Error::Invalid)));
    assert!(matches!(
        pool.lseek(&f, -100, Whence::Cur),
        Err(Error::Invalid)
    ));
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 9);

    // Seek past the end and write: the gap reads back as zeros.
    assert_eq!(pool.lseek(&f, 100, Whence::End).unwrap(), 109);
    assert_eq!(pool.write(&f, b"XYZ\0").unwrap(), 4);
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 113);
    assert_eq!(pool.file_size(&f), 113);

    assert_eq!(pool.lseek(&f, 0, Whence::Set).unwrap(), 0);
    buf.fill(0xff);
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 113);
    assert_eq!(&buf[..9], b"pmemin S\0");
    assert!(buf[9..109].iter().all(|&b| b == 0));
    assert_eq!(&buf[109..113], b"XYZ\0");
    assert!(buf[113..].iter().all(|&b| b == 0xff));
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 113);

    pool.close_file(f);

    let entries = pool.list_root();
    assert_eq!(entries.iter().find(|e| e.name == "file1").unwrap().size, 113);

    pool.unlink("/file1").unwrap();
    let stats = pool.stats();
    assert_eq!(stats.inodes, 1);
    assert_eq!(stats.blocks, 0);
    assert_eq!(stats.block_arrays, 0);

    // Block-sized writes land on exact boundaries.
    let f = pool
        .open_file("/file1", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
        .unwrap();
    let zeros = [0u8; 4096];
    let ones = [0xffu8; 4096];
    assert_eq!(pool.write(&f, &zeros).unwrap(), 4096);
    assert_eq!(pool.file_size(&f), 4096);
    assert_eq!(pool.write(&f, &ones).unwrap(), 4096);
    assert_eq!(pool.file_size(&f), 8192);
    assert_eq!(pool.lseek(&f, 0, Whence::Cur).unwrap(), 8192);
    assert_eq!(pool.lseek(&f, 4096, Whence::Set).unwrap(), 4096);
    let mut big = vec![0u8; 4096];
    assert_eq!(pool.read(&f, &mut big).unwrap(), 4096);
    assert_eq!(&big[..], &ones[..]);
    assert_eq!(pool.file_size(&f), 8192);
    pool.close_file(f);

    pool.unlink("/file1").unwrap();
    pool.close();
}

/// Deterministic filler so write/read loops can verify content.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(37) >> 3) as u8).collect()
}

#[test]
fn bulk_write_then_read_back() {
    let path = TempPool::new("bulk");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let chunk = pattern(4 * 4096 - 1000);
    let loops = (8 << 20) / chunk.len();

    let f = pool
        .open_file("/big", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    for _ in 0..loops {
        assert_eq!(pool.write(&f, &chunk).unwrap(), chunk.len());
    }
    pool.close_file(f);

    let entries = pool.list_root();
    assert_eq!(
        entries.iter().find(|e| e.name == "big").unwrap().size,
        (loops * chunk.len()) as u64
    );

    let f = pool.open_file("/big", libc::O_RDONLY, 0).unwrap();
    let mut buf = vec![0u8; chunk.len()];
    for _ in 0..loops {
        buf.fill(0);
        assert_eq!(pool.read(&f, &mut buf).unwrap(), chunk.len());
        assert_eq!(buf, chunk);
    }
    assert_eq!(pool.read(&f, &mut buf[..1023]).unwrap(), 0);
    pool.close_file(f);

    pool.unlink("/big").unwrap();
    pool.close();
}

/// Forces small blocks so a modest file crosses block-array boundaries
/// (one array holds 100 blocks).
#[test]
fn writes_cross_block_arrays() {
    let path = TempPool::new("xarray");
    let cfg = Config {
        block_size: 4096,
        ..Config::default()
    };
    let pool = FilePool::mkfs_with(path.as_path(), POOL_SIZE, 0o600, cfg).unwrap();

    let data = pattern(1 << 20); // 256 blocks, 3 arrays
    let f = pool
        .open_file("/spread", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, &data).unwrap(), data.len());
    assert!(pool.stats().block_arrays >= 3);

    // Random-access reads across array boundaries.
    for &(off, len) in &[(0usize, 4096usize), (407_000, 8192), (1_000_000, 48_576)] {
        let mut buf = vec![0u8; len];
        assert_eq!(pool.lseek(&f, off as i64, Whence::Set).unwrap(), off as u64);
        assert_eq!(pool.read(&f, &mut buf).unwrap(), len);
        assert_eq!(&buf[..], &data[off..off + len]);
    }

    // Overwrite a stretch spanning an array boundary and re-verify.
    let patch = pattern(12_000).iter().map(|b| b ^ 0xaa).collect::<Vec<_>>();
    let patch_off = 100 * 4096 - 6000; // straddles the first boundary
    assert_eq!(
        pool.lseek(&f, patch_off as i64, Whence::Set).unwrap(),
        patch_off as u64
    );
    assert_eq!(pool.write(&f, &patch).unwrap(), patch.len());
    assert_eq!(pool.lseek(&f, patch_off as i64, Whence::Set).unwrap(), patch_off as u64);
    let mut buf = vec![0u8; patch.len()];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), patch.len());
    assert_eq!(buf, patch);

    pool.close_file(f);
    pool.close();

    // Contents survive reopen.
    let pool = FilePool::open_with(path.as_path(), cfg).unwrap();
    let f = pool.open_file("/spread", libc::O_RDONLY, 0).unwrap();
    assert_eq!(
        pool.lseek(&f, patch_off as i64, Whence::Set).unwrap(),
        patch_off as u64
    );
    let mut buf = vec![0u8; patch.len()];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), patch.len());
    assert_eq!(buf, patch);
    pool.close_file(f);
    pool.close();
}

/// Every combination of data tracking and block replacement must agree on
/// what an overwrite produces.
#[test]
fn overwrite_under_all_tracking_policies() {
    for (track_data, replace_blocks) in [(false, false), (true, false), (true, true), (false, true)]
    {
        let path = TempPool::new("policy");
        let cfg = Config {
            block_size: 4096,
            track_data,
            replace_blocks,
            ..Config::default()
        };
        let pool = FilePool::mkfs_with(path.as_path(), 32 << 20, 0o600, cfg).unwrap();

        let first = pattern(8192);
        let second: Vec<u8> = first.iter().map(|b| b ^ 0x55).collect();

        let f = pool
            .open_file("/f", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
            .unwrap();
        assert_eq!(pool.write(&f, &first).unwrap(), first.len());

        // Full-block overwrite (the replace_blocks fast path when enabled).
        assert_eq!(pool.lseek(&f, 0, Whence::Set).unwrap(), 0);
        assert_eq!(pool.write(&f, &second).unwrap(), second.len());

        // Partial overwrite in the middle of a block.
        assert_eq!(pool.lseek(&f, 1000, Whence::Set).unwrap(), 1000);
        assert_eq!(pool.write(&f, b"patch").unwrap(), 5);

        let mut expect = second.clone();
        expect[1000..1005].copy_from_slice(b"patch");

        assert_eq!(pool.lseek(&f, 0, Whence::Set).unwrap(), 0);
        let mut buf = vec![0u8; expect.len()];
        assert_eq!(pool.read(&f, &mut buf).unwrap(), expect.len());
        assert_eq!(buf, expect, "track_data={track_data} replace_blocks={replace_blocks}");
        assert_eq!(pool.file_size(&f), 8192);

        pool.close_file(f);
        pool.close();

        let pool = FilePool::open_with(path.as_path(), cfg).unwrap();
        let f = pool.open_file("/f", libc::O_RDONLY, 0).unwrap();
        let mut buf = vec![0u8; expect.len()];
        assert_eq!(pool.read(&f, &mut buf).unwrap(), expect.len());
        assert_eq!(buf, expect);
        pool.close_file(f);
        pool.close();
    }
}

/// The optional walk accelerators must not change observable behaviour.
#[test]
fn walk_optimisations_agree() {
    let mut reference: Option<Vec<u8>> = None;
    for (list_walk, tree_walk) in [(false, false), (true, false), (false, true), (true, true)] {
        let path = TempPool::new("walks");
        let cfg = Config {
            block_size: 4096,
            list_walk,
            tree_walk,
            ..Config::default()
        };
        let pool = FilePool::mkfs_with(path.as_path(), POOL_SIZE, 0o600, cfg).unwrap();

        let data = pattern(900 * 4096); // several fully-used arrays
        let f = pool
            .open_file("/w", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
            .unwrap();
        assert_eq!(pool.write(&f, &data).unwrap(), data.len());

        // Jump around: end, start, middle; then a sparse extension.
        let mut out = Vec::new();
        for &(off, len) in &[
            (data.len() - 4096, 4096usize),
            (0, 4096),
            (450 * 4096 + 123, 9000),
        ] {
            let mut buf = vec![0u8; len];
            assert_eq!(pool.lseek(&f, off as i64, Whence::Set).unwrap(), off as u64);
            assert_eq!(pool.read(&f, &mut buf).unwrap(), len);
            assert_eq!(&buf[..], &data[off..off + len]);
            out.extend_from_slice(&buf);
        }
        assert_eq!(pool.lseek(&f, 10_000, Whence::End).unwrap(), data.len() as u64 + 10_000);
        assert_eq!(pool.write(&f, b"tail").unwrap(), 4);
        assert_eq!(pool.lseek(&f, -(10_004), Whence::End).unwrap(), data.len() as u64);
        let mut gap = vec![0xffu8; 10_004];
        assert_eq!(pool.read(&f, &mut gap).unwrap(), 10_004);
        assert!(gap[..10_000].iter().all(|&b| b == 0));
        assert_eq!(&gap[10_000..], b"tail");
        out.extend_from_slice(&gap);

        if let Some(prev) = reference.take() {
            assert_eq!(prev, out, "list_walk={list_walk} tree_walk={tree_walk}");
            reference = Some(prev);
        } else {
            reference = Some(out);
        }

        pool.close_file(f);
        pool.close();
    }
}
