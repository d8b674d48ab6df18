//! Errno-style errors.
//!
//! Every user-visible operation reports failures through [`Error`], whose
//! variants map one-to-one onto the POSIX error numbers the equivalent libc
//! call would set. Transactional mutators deep inside the core return the
//! same type; aborting a transaction carries the value out to the caller
//! unchanged.
//!
//! The crate additionally keeps a thread-local copy of the last error
//! message, readable through [`errormsg`], so that callers which only see a
//! failed `Result` can still obtain a human-readable description.

use std::cell::RefCell;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("bad address")]
    Fault,
    #[error("invalid argument")]
    Invalid,
    #[error("operation not supported")]
    NotSup,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("bad file descriptor")]
    BadFile,
    #[error("file too large")]
    TooBig,
    #[error("cannot allocate memory")]
    NoMem,
    #[error("no such device")]
    NoDevice,
    #[error("input/output error")]
    Io,
}

impl Error {
    /// The `errno` value an equivalent libc call would have produced.
    pub fn errno(self) -> i32 {
        match self {
            Error::Fault => libc::EFAULT,
            Error::Invalid => libc::EINVAL,
            Error::NotSup => libc::ENOTSUP,
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::IsDir => libc::EISDIR,
            Error::NotDir => libc::ENOTDIR,
            Error::BadFile => libc::EBADF,
            Error::TooBig => libc::EFBIG,
            Error::NoMem => libc::ENOMEM,
            Error::NoDevice => libc::ENODEV,
            Error::Io => libc::EIO,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        record_errormsg(format_args!("{}", err));
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Error::NoMem,
            Some(libc::ENOENT) => Error::NotFound,
            Some(libc::EEXIST) => Error::Exists,
            _ => Error::Io,
        }
    }
}

thread_local! {
    static LAST_ERRORMSG: RefCell<String> = RefCell::new(String::new());
}

/// Remembers `msg` as the calling thread's last error message.
pub(crate) fn record_errormsg(msg: fmt::Arguments<'_>) {
    LAST_ERRORMSG.with(|m| {
        let mut m = m.borrow_mut();
        m.clear();
        fmt::write(&mut *m, msg).expect("errormsg format");
    });
}

/// Remembers `err`'s description and hands it back, for `return fail(..)`
/// call sites.
pub(crate) fn fail<T>(err: Error) -> Result<T> {
    record_errormsg(format_args!("{}", err));
    Err(err)
}

/// Returns the last error message recorded on the calling thread.
pub fn errormsg() -> String {
    LAST_ERRORMSG.with(|m| m.borrow().clone())
}
