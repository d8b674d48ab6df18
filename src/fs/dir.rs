//! Directory operations.
//!
//! A directory is an inode whose data points at a chain of dentry pages.
//! Lookup is a linear scan under the parent's read lock; insertion and
//! removal run inside a transaction with the parent write-locked by the
//! caller. Removing the last name of a file hands over to the inode
//! module, which frees the file in the same transaction once no handle
//! holds it either.

use std::cell::Cell;
use std::mem;
use std::sync::atomic::Ordering;

use crate::error::{fail, Error, Result};
use crate::fs::layout::{Dentry, Dir, Inode, Timespec, TYPE_DIR};
use crate::fs::FilePool;
use crate::obj::{Obj, Tx};
use crate::param::{MAX_FILE_NAME, NUM_DENTRIES};

/// One root-directory entry, as reported by [`FilePool::list_root`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub nlink: u64,
    pub size: u64,
    pub flags: u64,
}

fn dentry_off(dir: Obj<Dir>, idx: usize) -> u64 {
    dir.field_off(mem::offset_of!(Dir, dentries)) + (idx * mem::size_of::<Dentry>()) as u64
}

impl FilePool {
    /// Records one full path the child is reachable by, for log lines.
    pub(crate) fn set_path_debug(&self, parent: Obj<Inode>, child: Obj<Inode>, name: &[u8]) {
        let child_rt = self.inode_get(child);
        let mut path = child_rt.path.lock();
        if path.is_some() {
            return;
        }
        let name = String::from_utf8_lossy(name).into_owned();
        if parent.is_null() {
            *path = Some(name);
            return;
        }
        let ppath = self.inode_get(parent).path_str();
        *path = Some(if ppath == "/" {
            format!("/{name}")
        } else {
            format!("{ppath}/{name}")
        });
    }

    /// Adds a dentry naming `child` to `parent`.
    ///
    /// Must be called inside a transaction with `parent` write-locked by
    /// the caller.
    pub(crate) fn add_dentry(
        &self,
        tx: &Tx<'_>,
        parent: Obj<Inode>,
        name: &[u8],
        child: Obj<Inode>,
        tm: Timespec,
    ) -> Result<()> {
        log::debug!(
            "dentry {:?} parent {:#x} child {:#x}",
            String::from_utf8_lossy(name),
            parent.off(),
            child.off()
        );

        if name.len() > MAX_FILE_NAME {
            log::warn!("file name too long ({} bytes)", name.len());
            return fail(Error::Invalid);
        }

        // SAFETY throughout: the caller write-locks the parent, giving us
        // exclusive access to the whole dentry chain.
        let mut dir = unsafe { (*self.obj().get_raw(parent)).data.dir() };
        assert!(!dir.is_null());

        let mut taken: Option<(Obj<Dir>, usize)> = None;
        while !dir.is_null() {
            let node = self.obj().get_raw(dir);
            for idx in 0..NUM_DENTRIES {
                let slot = unsafe { &(*node).dentries[idx] };
                if !slot.is_empty() && slot.name_bytes() == name {
                    return fail(Error::Exists);
                }
                if taken.is_none() && slot.is_empty() {
                    tx.add_field(dir, mem::offset_of!(Dir, used), mem::size_of::<u64>());
                    unsafe { (*node).used += 1 };
                    taken = Some((dir, idx));
                }
            }
            if taken.is_none() && unsafe { (*node).next }.is_null() {
                let fresh: Obj<Dir> = tx.zalloc(TYPE_DIR)?;
                tx.add_field(dir, mem::offset_of!(Dir, next), mem::size_of::<u64>());
                unsafe { (*node).next = fresh };
            }
            dir = unsafe { (*node).next };
        }

        let (node, idx) = taken.expect("no free dentry after growing the chain");
        let off = dentry_off(node, idx);
        tx.add_range(off, mem::size_of::<Dentry>());
        {
            let dentry = self.obj().ptr(off) as *mut Dentry;
            unsafe {
                (*dentry).inode = child;
                (*dentry).set_name(name);
            }
        }

        tx.add_field(child, mem::offset_of!(Inode, nlink), mem::size_of::<u64>());
        unsafe { (*self.obj().get_raw(child)).nlink += 1 };

        // ctime follows link-count changes; the parent's mtime follows
        // entry creation and deletion.
        tx.add_field(child, mem::offset_of!(Inode, ctime), mem::size_of::<Timespec>());
        unsafe { (*self.obj().get_raw(child)).ctime = tm };
        tx.add_field(parent, mem::offset_of!(Inode, mtime), mem::size_of::<Timespec>());
        unsafe { (*self.obj().get_raw(parent)).mtime = tm };

        self.set_path_debug(parent, child, name);
        Ok(())
    }

    /// Creates a directory inode under `parent` (null for the root), with
    /// its "." and ".." entries in place.
    ///
    /// Must be called inside a transaction with `parent` write-locked by
    /// the caller.
    pub(crate) fn new_dir(
        &self,
        tx: &Tx<'_>,
        parent: Obj<Inode>,
        name: &[u8],
    ) -> Result<Obj<Inode>> {
        log::debug!(
            "new dir {:?} parent {:#x}",
            String::from_utf8_lossy(name),
            parent.off()
        );

        let t = Timespec::now();
        let child = self.inode_alloc(tx, (libc::S_IFDIR | 0o777) as u64, t)?;
        self.set_path_debug(parent, child, name);

        let first: Obj<Dir> = tx.zalloc(TYPE_DIR)?;
        // SAFETY: the child inode is private to this transaction.
        unsafe { (*self.obj().get_raw(child)).data.set_dir(first) };
        tx.mark_dirty(
            child.field_off(mem::offset_of!(Inode, data)),
            mem::size_of::<u64>(),
        );

        self.add_dentry(tx, child, b".", child, t)?;
        if parent.is_null() {
            // The root's ".." points back at itself.
            self.add_dentry(tx, child, b"..", child, t)?;
        } else {
            self.add_dentry(tx, child, b"..", parent, t)?;
        }
        Ok(child)
    }

    /// Scans `parent` for `name`. Returns the dentry's pool offset and the
    /// page holding it. The caller must hold a lock on `parent`.
    fn lookup_dentry_locked(&self, parent: Obj<Inode>, name: &[u8]) -> Result<(u64, Obj<Dir>)> {
        // SAFETY: locked by the caller.
        if !unsafe { self.obj().get(parent) }.is_dir() {
            return fail(Error::NotDir);
        }
        let mut dir = unsafe { self.obj().get(parent) }.data.dir();
        while !dir.is_null() {
            let node = self.obj().get_raw(dir);
            for idx in 0..NUM_DENTRIES {
                // SAFETY: as above.
                let slot = unsafe { &(*node).dentries[idx] };
                if !slot.is_empty() && slot.name_bytes() == name {
                    return Ok((dentry_off(dir, idx), dir));
                }
            }
            dir = unsafe { (*node).next };
        }
        fail(Error::NotFound)
    }

    /// Looks `name` up in `parent` and takes a runtime reference on the
    /// found inode. Does not need a transaction.
    pub(crate) fn lookup_dentry(&self, parent: Obj<Inode>, name: &[u8]) -> Result<Obj<Inode>> {
        let parent_rt = self.inode_get(parent);
        parent_rt.lock.rlock();
        let res = self.lookup_dentry_locked(parent, name).map(|(off, _)| {
            // SAFETY: parent read lock keeps the dentry in place.
            let inode = unsafe { (*(self.obj().ptr(off) as *const Dentry)).inode };
            self.inode_ref_path(inode, parent, name);
            inode
        });
        parent_rt.lock.runlock();
        res
    }

    /// Removes the dentry `name` from `parent`, dropping the target's link
    /// and possibly freeing it.
    ///
    /// Must be called inside a transaction with `parent` write-locked
    /// transactionally by the caller. `taken` reports an inode whose
    /// runtime reference the caller must drop if the transaction aborts
    /// after this function took it.
    pub(crate) fn unlink_dentry(
        &self,
        tx: &Tx<'_>,
        parent: Obj<Inode>,
        name: &[u8],
        taken: &Cell<Option<Obj<Inode>>>,
    ) -> Result<()> {
        log::debug!(
            "unlink {:?} parent {:#x}",
            String::from_utf8_lossy(name),
            parent.off()
        );

        let (off, dir) = self.lookup_dentry_locked(parent, name)?;

        tx.add_field(dir, mem::offset_of!(Dir, used), mem::size_of::<u64>());
        // SAFETY: parent write-locked by the caller.
        unsafe { (*self.obj().get_raw(dir)).used -= 1 };

        let dentry = self.obj().ptr(off) as *mut Dentry;
        let tinode = unsafe { (*dentry).inode };

        if unsafe { self.obj().get(tinode) }.is_dir() {
            return fail(Error::IsDir);
        }

        self.inode_ref(tinode);
        taken.set(Some(tinode));
        let rt = self.inode_get(tinode);
        rt.lock.tx_wlock(tx);

        assert!(unsafe { self.obj().get(tinode) }.nlink > 0);

        tx.add_field(tinode, mem::offset_of!(Inode, nlink), mem::size_of::<u64>());
        tx.add_range(off, mem::size_of::<Dentry>());

        unsafe {
            (*self.obj().get_raw(tinode)).nlink -= 1;
            (*dentry).name[0] = 0;
            (*dentry).inode = Obj::NULL;
        }

        self.inode_unref_locked(tx, tinode);
        taken.set(None);
        Ok(())
    }

    /// Collects the entries of `parent`. The caller must hold a lock on it.
    pub(crate) fn list(&self, parent: Obj<Inode>) -> Vec<DirEntryInfo> {
        let mut out = Vec::new();
        // SAFETY: locked by the caller.
        let mut dir = unsafe { self.obj().get(parent) }.data.dir();
        while !dir.is_null() {
            let drt = self.dir_get(dir);
            drt.refcnt.fetch_add(1, Ordering::SeqCst);

            let node = self.obj().get_raw(dir);
            for idx in 0..NUM_DENTRIES {
                // SAFETY: as above.
                let slot = unsafe { &(*node).dentries[idx] };
                if slot.is_empty() {
                    continue;
                }
                let child = slot.inode;
                if child != parent {
                    self.inode_ref_path(child, parent, slot.name_bytes());
                }
                {
                    // SAFETY: as above.
                    let inode = unsafe { self.obj().get(child) };
                    out.push(DirEntryInfo {
                        name: String::from_utf8_lossy(slot.name_bytes()).into_owned(),
                        nlink: inode.nlink,
                        size: inode.size,
                        flags: inode.flags,
                    });
                }
                if child != parent {
                    self.inode_unref_tx(child);
                }
            }

            drt.refcnt.fetch_sub(1, Ordering::SeqCst);
            dir = unsafe { (*node).next };
        }
        out
    }
}
