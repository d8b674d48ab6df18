//! A persistent-memory file system core.
//!
//! `pmfs` keeps file data and metadata in a transactional object pool
//! backed by a single file, and exposes a POSIX-like surface over it:
//! pool mkfs/open/close, file open/close, link/unlink, read/write/lseek.
//! The pool stays consistent across crashes and aborted operations; every
//! mutation runs inside a transaction, and per-session runtime state
//! (locks, reference counts, position caches) is revived lazily through a
//! generation-counter overlay rather than stored durably.
//!
//! ```no_run
//! use pmfs::FilePool;
//!
//! let pool = FilePool::mkfs("/tmp/fs.pool", 64 << 20, 0o600)?;
//! let file = pool.open_file("/hello", libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o644)?;
//! pool.write(&file, b"hello")?;
//! pool.close_file(file);
//! pool.close();
//! # Ok::<(), pmfs::Error>(())
//! ```
//!
//! The single flat root directory, the restricted flag set and the
//! environment-driven tuning knobs are described in the module docs of
//! `fs`, `fcntl` and `config` respectively.

use spin::Once;

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("pmfs requires a unix target");
    }
}

mod config;
mod error;
mod fcntl;
mod fs;
mod lock;
mod obj;
mod param;
#[cfg(test)]
mod test_util;

pub use config::Config;
pub use error::{errormsg, Error, Result};
pub use fs::{DirEntryInfo, File, FilePool, PoolStats, Whence};
pub use param::{MAJOR_VERSION, MINOR_VERSION};

/// One-time library initialisation: wires the logger to the
/// `PMFS_LOG_LEVEL` / `PMFS_LOG_FILE` environment variables. Called
/// automatically by pool creation and open; calling it earlier is
/// harmless.
pub fn init() {
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        let env = env_logger::Env::new().filter("PMFS_LOG_LEVEL");
        let mut builder = env_logger::Builder::from_env(env);
        if let Ok(path) = std::env::var("PMFS_LOG_FILE") {
            match std::fs::File::create(&path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(err) => eprintln!("pmfs: cannot open log file {path}: {err}"),
            }
        }
        let _ = builder.try_init();
    });
}

/// Checks the library version the caller was built against. Returns a
/// description of the mismatch, or `None` when compatible.
pub fn check_version(major: u32, minor: u32) -> Option<String> {
    if major != MAJOR_VERSION {
        return Some(format!(
            "library major version mismatch (need {major}, found {MAJOR_VERSION})"
        ));
    }
    if minor > MINOR_VERSION {
        return Some(format!(
            "library minor version mismatch (need {minor}, found {MINOR_VERSION})"
        ));
    }
    None
}
