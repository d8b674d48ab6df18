//! `open(2)` flag validation.
//!
//! The accepted surface is narrow: `O_CREAT` and `O_EXCL` do what they
//! say; a handful of flags that describe properties this store always has
//! (`O_CLOEXEC`, `O_DIRECT`, `O_DSYNC`, `O_NOCTTY`, `O_SYNC`) are accepted
//! and ignored; everything else, known or unknown, fails with `ENOTSUP`
//! before any side effect.

use bitflags::bitflags;

use crate::error::{fail, record_errormsg, Error, Result};

bitflags! {
    struct OpenFlags: i32 {
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const CLOEXEC = libc::O_CLOEXEC;
        const DIRECT = libc::O_DIRECT;
        const DSYNC = libc::O_DSYNC;
        const NOCTTY = libc::O_NOCTTY;
        const SYNC = libc::O_SYNC;
        const APPEND = libc::O_APPEND;
        const ASYNC = libc::O_ASYNC;
        const DIRECTORY = libc::O_DIRECTORY;
        const NOATIME = libc::O_NOATIME;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const NONBLOCK = libc::O_NONBLOCK;
        const PATH = libc::O_PATH;
        const TMPFILE = libc::O_TMPFILE;
        const TRUNC = libc::O_TRUNC;
    }
}

/// Flags recognised but not implemented.
const UNSUPPORTED: &[(OpenFlags, &str)] = &[
    (OpenFlags::APPEND, "O_APPEND"),
    (OpenFlags::ASYNC, "O_ASYNC"),
    (OpenFlags::DIRECTORY, "O_DIRECTORY"),
    (OpenFlags::NOATIME, "O_NOATIME"),
    (OpenFlags::NOFOLLOW, "O_NOFOLLOW"),
    (OpenFlags::NONBLOCK, "O_NONBLOCK"),
    (OpenFlags::PATH, "O_PATH"),
    (OpenFlags::TMPFILE, "O_TMPFILE"),
    (OpenFlags::TRUNC, "O_TRUNC"),
];

/// Flags describing behaviour the store provides anyway.
const ALWAYS_ON: &[(OpenFlags, &str)] = &[
    (OpenFlags::CLOEXEC, "O_CLOEXEC"),
    (OpenFlags::DIRECT, "O_DIRECT"),
    (OpenFlags::DSYNC, "O_DSYNC"),
    (OpenFlags::NOCTTY, "O_NOCTTY"),
    (OpenFlags::SYNC, "O_SYNC"),
];

/// Validates `flags` and returns the `(read, write)` pair implied by the
/// access mode.
pub(crate) fn check_flags(flags: i32) -> Result<(bool, bool)> {
    let known = match OpenFlags::from_bits(flags & !libc::O_ACCMODE) {
        Some(known) => known,
        None => {
            record_errormsg(format_args!("unknown flag in {:#x}", flags));
            return Err(Error::NotSup);
        }
    };

    for &(flag, name) in UNSUPPORTED {
        if known.contains(flag) {
            log::warn!("{} is not supported", name);
            return fail(Error::NotSup);
        }
    }
    for &(flag, name) in ALWAYS_ON {
        if known.contains(flag) {
            log::info!("{} is always enabled", name);
        }
    }

    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => Ok((true, false)),
        libc::O_WRONLY => Ok((false, true)),
        libc::O_RDWR => Ok((true, true)),
        _ => {
            record_errormsg(format_args!("invalid access mode in {:#x}", flags));
            Err(Error::NotSup)
        }
    }
}
