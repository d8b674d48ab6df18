//! Crash consistency: pools dropped without close behave like a crashed
//! process, and the next open must repair the opened-inodes leftovers.

mod common;

use common::{root_names, TempPool};
use pmfs::{Error, FilePool, Whence};

const POOL_SIZE: u64 = 64 << 20;

#[test]
fn contents_survive_close_and_reopen() {
    let path = TempPool::new("reopen");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    for (name, content) in [("/one", &b"first"[..]), ("/two", &b"second file"[..])] {
        let f = pool
            .open_file(name, libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
            .unwrap();
        assert_eq!(pool.write(&f, content).unwrap(), content.len());
        pool.close_file(f);
    }
    let names_before = root_names(&pool);
    pool.close();

    let pool = FilePool::open(path.as_path()).unwrap();
    assert_eq!(root_names(&pool), names_before);
    for (name, content) in [("/one", &b"first"[..]), ("/two", &b"second file"[..])] {
        let f = pool.open_file(name, libc::O_RDONLY, 0).unwrap();
        let mut buf = vec![0u8; content.len() + 16];
        assert_eq!(pool.read(&f, &mut buf).unwrap(), content.len());
        assert_eq!(&buf[..content.len()], content);
        pool.close_file(f);
    }
    pool.close();
}

#[test]
fn link_then_unlink_preserves_content() {
    let path = TempPool::new("links");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/a", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, b"kept alive by the link").unwrap(), 22);
    pool.close_file(f);

    pool.link("/a", "/a.link").unwrap();
    pool.unlink("/a").unwrap();

    let f = pool.open_file("/a.link", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 22);
    assert_eq!(&buf[..22], b"kept alive by the link");
    pool.close_file(f);
    pool.close();

    // The link relationship is durable.
    let pool = FilePool::open(path.as_path()).unwrap();
    assert!(matches!(pool.open_file("/a", 0, 0), Err(Error::NotFound)));
    let f = pool.open_file("/a.link", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 22);
    assert_eq!(&buf[..22], b"kept alive by the link");
    pool.close_file(f);
    pool.close();
}

#[test]
fn unlinked_open_file_stays_writable_until_close() {
    let path = TempPool::new("orphan");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/f", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, b"before unlink").unwrap(), 13);

    pool.unlink("/f").unwrap();
    assert!(matches!(pool.open_file("/f", 0, 0), Err(Error::NotFound)));

    // The handle still works with the name gone.
    assert_eq!(pool.write(&f, b" and after").unwrap(), 10);
    assert_eq!(pool.lseek(&f, 0, Whence::Set).unwrap(), 0);
    let mut buf = [0u8; 32];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 23);
    assert_eq!(&buf[..23], b"before unlink and after");

    // The inode survives exactly until the last handle closes.
    assert_eq!(pool.stats().inodes, 2);
    pool.close_file(f);
    assert_eq!(pool.stats().inodes, 1);
    assert_eq!(pool.stats().blocks, 0);

    pool.close();

    let pool = FilePool::open(path.as_path()).unwrap();
    assert!(matches!(pool.open_file("/f", 0, 0), Err(Error::NotFound)));
    pool.close();
}

#[test]
fn crash_recovery_frees_nameless_open_files() {
    let path = TempPool::new("crash");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    let f = pool
        .open_file("/doomed", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(pool.write(&f, &vec![7u8; 100_000]).unwrap(), 100_000);
    pool.unlink("/doomed").unwrap();

    // Also a file that keeps its name; recovery must leave it alone.
    let kept = pool
        .open_file("/kept", libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(pool.write(&kept, b"survives").unwrap(), 8);

    assert_eq!(pool.stats().inodes, 3);

    // Crash: neither handle nor pool is closed.
    drop(f);
    drop(kept);
    drop(pool);

    let pool = FilePool::open(path.as_path()).unwrap();
    // The nameless inode and its data are gone, the named one is intact.
    let stats = pool.stats();
    assert_eq!(stats.inodes, 2);
    assert_eq!(stats.blocks, 1);
    assert_eq!(root_names(&pool), [".", "..", "kept"]);

    let f = pool.open_file("/kept", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(pool.read(&f, &mut buf).unwrap(), 8);
    assert_eq!(&buf[..8], b"survives");
    pool.close_file(f);
    pool.close();

    // A second clean open finds nothing left to recover.
    let pool = FilePool::open(path.as_path()).unwrap();
    assert_eq!(pool.stats().inodes, 2);
    pool.close();
}

#[test]
fn recovery_shrinks_the_opened_chain() {
    let path = TempPool::new("chain");
    let pool = FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600).unwrap();

    // Hold more files open than one opened-inodes array has slots (64),
    // forcing the chain to grow, then crash.
    let mut handles = Vec::new();
    for i in 0..70 {
        handles.push(
            pool.open_file(&format!("/h{i}"), libc::O_CREAT | libc::O_EXCL, 0o644)
                .unwrap(),
        );
    }
    assert!(pool.stats().inode_arrays >= 2);
    drop(handles);
    drop(pool);

    // Recovery keeps every named file and compacts the chain to one array.
    let pool = FilePool::open(path.as_path()).unwrap();
    assert_eq!(pool.stats().inode_arrays, 1);
    assert_eq!(pool.stats().inodes, 71);
    for i in 0..70 {
        let f = pool.open_file(&format!("/h{i}"), 0, 0).unwrap();
        pool.close_file(f);
    }
    pool.close();
}

#[test]
fn pool_open_rejects_bad_files() {
    let path = TempPool::new("badpool");
    assert!(matches!(
        FilePool::open(path.as_path()),
        Err(Error::NotFound)
    ));

    std::fs::write(path.as_path(), vec![0x5a; 128 * 1024]).unwrap();
    assert!(matches!(
        FilePool::open(path.as_path()),
        Err(Error::NoDevice)
    ));

    // mkfs refuses to clobber an existing file.
    assert!(matches!(
        FilePool::mkfs(path.as_path(), POOL_SIZE, 0o600),
        Err(Error::Exists)
    ));
}
