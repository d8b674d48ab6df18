//! Inode operations.
//!
//! An inode's lifetime is governed by two counters: `nlink` on media (how
//! many dentries point at it) and the runtime reference count (how many
//! open handles and in-flight operations hold it). The inode's storage is
//! released inside the same transaction that drops the last of both, so an
//! abort anywhere along the way resurrects the inode intact.
//!
//! Teardown doubles as a generation transition: while a dropping reference
//! is being processed, the inode's vptr slot is parked at `run_id − 1` so
//! concurrent getters wait, and once the teardown commits the slot reads
//! `run_id − 2`, making the next access rebuild fresh runtime state.
//!
//! The opened-inodes arrays implement the crash-recovery set: an inode is
//! registered there while some handle holds it, and a pool left dirty by a
//! crash frees every registered inode with no links left (see the pool
//! module).

use std::mem;
use std::sync::atomic::Ordering;
use std::thread;

use crate::error::Result;
use crate::fs::layout::{
    Inode, InodeArray, Timespec, INODE_ARRAY_BODY_OFF, TYPE_INODE, TYPE_INODE_ARRAY,
    VPTR_DATA_OFF, VPTR_RUN_ID_OFF,
};
use crate::fs::rt::InodeRt;
use crate::fs::FilePool;
use crate::obj::{Obj, Stage, Tx};
use crate::param::INODES_PER_ARRAY;

impl FilePool {
    /// Allocates a fresh inode with the given mode bits, attaches runtime
    /// state holding one reference, and schedules that state's teardown
    /// should the transaction abort.
    pub(crate) fn inode_alloc(
        &self,
        tx: &Tx<'_>,
        flags: u64,
        t: Timespec,
    ) -> Result<Obj<Inode>> {
        log::debug!("allocating inode, flags {:#o}", flags);

        let inode: Obj<Inode> = tx.zalloc(TYPE_INODE)?;
        {
            // SAFETY: freshly allocated; only this transaction sees it.
            let node = unsafe { self.obj().get_mut(inode) };
            node.flags = flags;
            node.ctime = t;
            node.mtime = t;
            node.atime = t;
            node.nlink = 0;
        }
        tx.mark_dirty(inode.off(), mem::size_of::<Inode>());

        let rt = self.inode_ref(inode);
        let rt_ptr = rt as *const InodeRt as usize;
        tx.push_front(Stage::OnAbort, move || {
            // SAFETY: the inode's chunk is rolled back together with this
            // callback, so no one can reach the runtime state any more.
            drop(unsafe { Box::from_raw(rt_ptr as *mut InodeRt) });
        });
        Ok(inode)
    }

    /// Releases the inode's storage: the dentry pages of a directory or the
    /// whole block chain of a regular file, then the inode itself.
    ///
    /// Must be called inside a transaction.
    pub(crate) fn inode_free(&self, tx: &Tx<'_>, tinode: Obj<Inode>) {
        log::debug!("freeing inode {:#x}", tinode.off());

        let (is_dir, is_regular, first) = {
            // SAFETY: caller holds the inode exclusively (write-locked or
            // unreachable).
            let node = unsafe { self.obj().get(tinode) };
            (node.is_dir(), node.is_regular_file(), node.data)
        };

        if is_dir {
            let mut dir = first.dir();
            while !dir.is_null() {
                // SAFETY: as above; the chain is owned by this inode.
                let node = unsafe { self.obj().get(dir) };
                // Should have been caught earlier.
                assert_eq!(node.used, 0, "freeing a non-empty directory");
                let next = node.next;
                tx.free(dir);
                dir = next;
            }
        } else if is_regular {
            let mut arr = first.blocks();
            while !arr.is_null() {
                // SAFETY: as above.
                let node = unsafe { self.obj().get(arr) };
                for block in &node.blocks[..node.blocks_allocated as usize] {
                    tx.free_at(block.data);
                }
                let next = node.next;
                tx.free(arr);
                arr = next;
            }
            if !first.blocks().is_null() {
                tx.add_field(tinode, mem::offset_of!(Inode, data), mem::size_of::<u64>());
                // SAFETY: exclusive per above; previous shared borrow ended.
                unsafe { self.obj().get_mut(tinode) }.data.set_blocks(Obj::NULL);
            }
        } else {
            panic!("unknown inode type {:#o}", unsafe { self.obj().get(tinode) }.flags);
        }
        tx.free(tinode);
    }

    /// Drops one runtime reference, freeing the inode if both counters are
    /// gone. The caller must already hold the inode write lock
    /// transactionally.
    pub(crate) fn inode_unref_locked(&self, tx: &Tx<'_>, tinode: Obj<Inode>) {
        let rt = self.inode_get(tinode);
        log::debug!("inode {:#x} unref (locked) path {}", tinode.off(), rt.path_str());
        assert_ne!(rt.refcnt.load(Ordering::SeqCst), 0);
        self.unref_work(tx, rt, tinode);
    }

    /// Drops one runtime reference; takes the inode write lock itself.
    pub(crate) fn inode_unref(&self, tx: &Tx<'_>, tinode: Obj<Inode>) {
        let rt = self.inode_get(tinode);
        log::debug!("inode {:#x} unref path {}", tinode.off(), rt.path_str());
        assert_ne!(rt.refcnt.load(Ordering::SeqCst), 0);
        rt.lock.tx_wlock(tx);
        self.unref_work(tx, rt, tinode);
    }

    /// Drops one runtime reference in a transaction of its own.
    pub(crate) fn inode_unref_tx(&self, tinode: Obj<Inode>) {
        self.obj()
            .tx(|tx| {
                self.inode_unref(tx, tinode);
                Ok(())
            })
            .expect("inode unref transaction aborted");
    }

    /// The common part of unref: decrement under the vptr-slot lock and
    /// tear down if this was the last reference.
    fn unref_work(&self, tx: &Tx<'_>, rt: &InodeRt, tinode: Obj<Inode>) {
        let pool_run_id = self.run_id();
        // The slot's generation word is the teardown lock: parked at
        // `run_id - 1`, concurrent getters wait in vptr_get.
        let word = self.obj().atomic_u64(tinode.field_off(VPTR_RUN_ID_OFF));
        while word
            .compare_exchange(
                pool_run_id,
                pool_run_id - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            thread::yield_now();
        }

        if rt.refcnt.fetch_sub(1, Ordering::SeqCst) > 1 {
            // Still referenced: republish the slot as valid.
            word.store(pool_run_id, Ordering::Release);
            rt.lock.tx_unlock_on_commit(tx);
            return;
        }

        log::trace!("last ref of inode {:#x} path {}", tinode.off(), rt.path_str());

        // On media: forget the runtime pointer.
        tx.add_field(tinode, VPTR_DATA_OFF, mem::size_of::<u64>());
        self.obj()
            .atomic_u64(tinode.field_off(VPTR_DATA_OFF))
            .store(0, Ordering::Release);

        if let Some(slot) = *rt.opened.lock() {
            self.inode_array_unregister(tx, slot.arr, slot.idx);
        }

        rt.lock.tx_unlock_on_commit(tx);

        // The runtime state dies when the teardown commits; until then the
        // parked slot keeps everyone out.
        let rt_ptr = rt as *const InodeRt as usize;
        tx.push_back(Stage::OnCommit, move || {
            // SAFETY: the reference count reached zero and the slot was
            // claimed, so this pointer is the only way left to the box.
            drop(unsafe { Box::from_raw(rt_ptr as *mut InodeRt) });
        });

        // SAFETY: we hold the write lock and the parked slot.
        let nlink = unsafe { self.obj().get(tinode) }.nlink;
        if nlink == 0 {
            // The inode is going away entirely; anything looking at the
            // slot afterwards must reconstruct.
            word.store(pool_run_id - 2, Ordering::Release);
            self.inode_free(tx, tinode);
        } else {
            let word_addr = word as *const _ as usize;
            let publish = move || {
                // SAFETY: media-resident word, outlives the transaction.
                let word = unsafe { &*(word_addr as *const std::sync::atomic::AtomicU64) };
                word.store(pool_run_id - 2, Ordering::Release);
            };
            tx.push_back(Stage::OnCommit, publish);
            tx.push_front(Stage::OnAbort, publish);
        }
    }

    /// Inserts `inode` into the opened-inodes chain starting at `array` and
    /// returns the slot it landed in.
    ///
    /// Must be called inside a transaction. Growing the chain leaves the
    /// grown array's mutex held until commit so traversal past it stays
    /// serialised with other inserters.
    pub(crate) fn inode_array_add(
        &self,
        tx: &Tx<'_>,
        mut array: Obj<InodeArray>,
        inode: Obj<Inode>,
    ) -> Result<(Obj<InodeArray>, usize)> {
        loop {
            // SAFETY throughout: inode arrays are never moved or freed
            // while the pool is open (recovery runs before any user
            // operation), and the array body is only touched under its
            // persistent mutex.
            let cur = self.obj().get_raw(array);
            unsafe { (*cur).mtx.lock(self.run_id()) };

            if unsafe { (*cur).used } < INODES_PER_ARRAY as u64 {
                let empty = unsafe { &(*cur).inodes }
                    .iter()
                    .position(|slot| slot.is_null());
                if let Some(idx) = empty {
                    unsafe { (*cur).mtx.unlock_on_abort(tx) };
                    tx.add_range(
                        array.field_off(INODE_ARRAY_BODY_OFF),
                        mem::size_of::<InodeArray>() - INODE_ARRAY_BODY_OFF,
                    );
                    unsafe {
                        (*cur).inodes[idx] = inode;
                        (*cur).used += 1;
                        (*cur).mtx.unlock_on_commit(tx);
                    }
                    return Ok((array, idx));
                }
            }

            let mut modified = false;
            if unsafe { (*cur).next }.is_null() {
                unsafe { (*cur).mtx.unlock_on_abort(tx) };
                let fresh: Obj<InodeArray> = tx.zalloc(TYPE_INODE_ARRAY)?;
                tx.add_field(array, mem::offset_of!(InodeArray, next), mem::size_of::<u64>());
                unsafe {
                    (*cur).next = fresh;
                    (*self.obj().get_raw(fresh)).prev = array;
                }
                tx.mark_dirty(
                    fresh.field_off(mem::offset_of!(InodeArray, prev)),
                    mem::size_of::<u64>(),
                );
                modified = true;
            }
            let next = unsafe { (*cur).next };
            if modified {
                unsafe { (*cur).mtx.unlock_on_commit(tx) };
            } else {
                unsafe { (*cur).mtx.unlock() };
            }
            array = next;
        }
    }

    /// Clears `idx` in `array`. Must be called inside a transaction.
    pub(crate) fn inode_array_unregister(&self, tx: &Tx<'_>, array: Obj<InodeArray>, idx: usize) {
        // SAFETY: see inode_array_add.
        let cur = self.obj().get_raw(array);
        unsafe { (*cur).mtx.tx_lock(tx, self.run_id()) };

        assert!(unsafe { (*cur).used } > 0);
        tx.add_range(
            array.field_off(INODE_ARRAY_BODY_OFF),
            mem::size_of::<InodeArray>() - INODE_ARRAY_BODY_OFF,
        );
        unsafe {
            (*cur).inodes[idx] = Obj::NULL;
            (*cur).used -= 1;
            (*cur).mtx.unlock_on_commit(tx);
        }
    }
}
