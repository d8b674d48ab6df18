//! Open files and the name-level operations: open, close, link, unlink.
//!
//! A handle owns one runtime reference on its inode and one on the parent
//! directory it was opened from. Opening a file also registers the inode
//! in the opened-inodes set, so a crash with the handle still open leaves
//! a breadcrumb for the next pool open to clean up. All name-level
//! mutations run in one transaction with the root directory write-locked.

use std::cell::{Cell, UnsafeCell};

use crate::error::{fail, record_errormsg, Error, Result};
use crate::fs::data::FileState;
use crate::fs::layout::{Inode, Super, Timespec, TYPE_INODE_ARRAY};
use crate::fs::path::check_path;
use crate::fs::rt::OpenedSlot;
use crate::fs::FilePool;
use crate::fcntl;
use crate::lock::HandleLock;
use crate::obj::{Obj, Tx};

/// An open file.
pub struct File {
    inode: Obj<Inode>,
    /// Directory this file was opened from.
    parent: Obj<Inode>,
    lock: HandleLock,
    state: UnsafeCell<FileState>,
    read: bool,
    write: bool,
}

// SAFETY: the mutable state behind `state` is only touched under `lock`.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub(crate) fn inode(&self) -> Obj<Inode> {
        self.inode
    }

    pub(crate) fn lock(&self) -> &HandleLock {
        &self.lock
    }

    pub(crate) fn state(&self) -> *mut FileState {
        self.state.get()
    }

    pub(crate) fn readable(&self) -> bool {
        self.read
    }

    pub(crate) fn writable(&self) -> bool {
        self.write
    }
}

impl FilePool {
    /// Registers `inode` in the opened-inodes set, creating the set on
    /// first use. Idempotent per session.
    fn register_opened_inode(&self, tx: &Tx<'_>, inode: Obj<Inode>) -> Result<()> {
        let rt = self.inode_get(inode);
        log::debug!("registering inode {:#x} path {}", inode.off(), rt.path_str());

        rt.lock.tx_wlock(tx);

        if rt.opened.lock().is_none() {
            let super_rt = self.super_rt();
            super_rt.lock.tx_wlock(tx);

            let sp = self.superblock();
            // SAFETY: superblock write-locked.
            let mut opened = unsafe { self.obj().get(sp) }.opened_inodes;
            if opened.is_null() {
                opened = tx.zalloc(TYPE_INODE_ARRAY)?;
                tx.add_field(
                    sp,
                    std::mem::offset_of!(Super, opened_inodes),
                    std::mem::size_of::<u64>(),
                );
                // SAFETY: as above; snapshotted.
                unsafe { (*self.obj().get_raw(sp)).opened_inodes = opened };
            }

            let (arr, idx) = self.inode_array_add(tx, opened, inode)?;
            *rt.opened.lock() = Some(OpenedSlot { arr, idx });

            super_rt.lock.tx_unlock_on_commit(tx);
        }

        rt.lock.tx_unlock_on_commit(tx);
        Ok(())
    }

    /// Opens (optionally creating) the file at `path`. Flags and mode per
    /// POSIX `open(2)`, restricted to the supported subset (see the fcntl
    /// module).
    pub fn open_file(&self, path: &str, flags: i32, mode: u32) -> Result<File> {
        log::debug!("open {:?} flags {:#x} mode {:#o}", path, flags, mode);

        let (read, write) = fcntl::check_flags(flags)?;

        if flags & libc::O_CREAT != 0 {
            if mode & !0o777 != 0 {
                record_errormsg(format_args!("invalid mode {:#o}", mode));
                return Err(Error::Invalid);
            }
        } else if mode != 0 {
            record_errormsg(format_args!(
                "non-zero mode ({:#o}) without O_CREAT",
                mode
            ));
            return Err(Error::Invalid);
        }
        // Execute bits are accepted and dropped.
        let mode = mode & !0o111;

        let name = check_path(path)?;

        // SAFETY: immutable after pool open.
        let parent = unsafe { self.obj().get(self.superblock()) }.root_inode;
        self.inode_ref(parent);

        let existing = match self.lookup_dentry(parent, name) {
            Ok(inode) => Some(inode),
            Err(Error::NotFound) => None,
            Err(err) => {
                self.inode_unref_tx(parent);
                return fail(err);
            }
        };

        let res = self.obj().tx(|tx| {
            match existing {
                None => {
                    if flags & libc::O_CREAT == 0 {
                        log::warn!("file {:?} does not exist", path);
                        return fail(Error::NotFound);
                    }
                }
                Some(inode) => {
                    if flags & (libc::O_CREAT | libc::O_EXCL) == (libc::O_CREAT | libc::O_EXCL) {
                        log::warn!("file {:?} already exists", path);
                        return fail(Error::Exists);
                    }
                    // SAFETY: a named inode's type bits never change.
                    if unsafe { self.obj().get(inode) }.is_dir() {
                        log::warn!("opening directories is not supported");
                        return fail(Error::IsDir);
                    }
                }
            }

            let inode = match existing {
                Some(inode) => inode,
                None => {
                    let parent_rt = self.inode_get(parent);
                    parent_rt.lock.tx_wlock(tx);

                    let t = Timespec::now();
                    let inode =
                        self.inode_alloc(tx, (libc::S_IFREG as u64) | mode as u64, t)?;
                    self.add_dentry(tx, parent, name, inode, t)?;

                    parent_rt.lock.tx_unlock_on_commit(tx);
                    inode
                }
            };

            self.register_opened_inode(tx, inode)?;
            Ok(inode)
        });

        match res {
            Ok(inode) => {
                log::debug!("{:?} opened inode {:#x}", path, inode.off());
                Ok(File {
                    inode,
                    parent,
                    lock: HandleLock::new(self.cfg().contention_level),
                    state: UnsafeCell::new(FileState::new()),
                    read,
                    write,
                })
            }
            Err(err) => {
                if let Some(old) = existing {
                    self.inode_unref_tx(old);
                }
                self.inode_unref_tx(parent);
                fail(err)
            }
        }
    }

    /// Closes a handle, dropping its inode and parent references. The
    /// inode is freed here if this was the last reference to an unlinked
    /// file.
    pub fn close_file(&self, file: File) {
        log::debug!(
            "close inode {:#x} path {}",
            file.inode.off(),
            self.inode_get(file.inode).path_str()
        );

        self.inode_unref_tx(file.inode);
        self.inode_unref_tx(file.parent);
        // The position cache and offset index die with the handle.
        drop(file);
    }

    /// Creates the hard link `newpath` to `oldpath`'s inode.
    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        log::debug!("link {:?} -> {:?}", newpath, oldpath);

        let old_name = check_path(oldpath)?;
        let new_name = check_path(newpath)?;

        // SAFETY: immutable after pool open.
        let parent = unsafe { self.obj().get(self.superblock()) }.root_inode;
        let parent_rt = self.inode_ref(parent);

        let mut src: Obj<Inode> = Obj::NULL;
        let mut dst: Obj<Inode> = Obj::NULL;
        let res = (|| {
            src = self.lookup_dentry(parent, old_name)?;
            match self.lookup_dentry(parent, new_name) {
                Ok(found) => {
                    dst = found;
                    return fail(Error::Exists);
                }
                Err(Error::NotFound) => {}
                Err(err) => return fail(err),
            }

            self.obj().tx(|tx| {
                parent_rt.lock.tx_wlock(tx);
                let t = Timespec::now();
                self.add_dentry(tx, parent, new_name, src, t)?;
                parent_rt.lock.tx_unlock_on_commit(tx);
                Ok(())
            })
        })();

        if !dst.is_null() {
            self.inode_unref_tx(dst);
        }
        if !src.is_null() {
            self.inode_unref_tx(src);
        }
        self.inode_unref_tx(parent);
        res
    }

    /// Deletes the name at `path`; the file itself lives on while any
    /// handle holds it.
    pub fn unlink(&self, path: &str) -> Result<()> {
        log::debug!("unlink {:?}", path);

        let name = check_path(path)?;

        // SAFETY: immutable after pool open.
        let parent = unsafe { self.obj().get(self.superblock()) }.root_inode;
        let parent_rt = self.inode_ref(parent);

        let taken = Cell::new(None);
        let res = self.obj().tx(|tx| {
            parent_rt.lock.tx_wlock(tx);
            self.unlink_dentry(tx, parent, name, &taken)?;
            parent_rt.lock.tx_unlock_on_commit(tx);
            Ok(())
        });

        if res.is_err() {
            if let Some(inode) = taken.get() {
                self.inode_unref_tx(inode);
            }
        }
        self.inode_unref_tx(parent);
        res
    }

    /// Current size of the open file, in bytes.
    pub fn file_size(&self, file: &File) -> u64 {
        // SAFETY: a racing write may move this, as it may in C; the value
        // read is some committed size.
        unsafe { self.obj().get(file.inode) }.size
    }
}
