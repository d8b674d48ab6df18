//! Transactions over the object pool.
//!
//! A transaction is a per-thread undo log plus a set of staged callbacks.
//! Mutators snapshot byte ranges before changing them; if the enclosing
//! [`ObjPool::tx`] body returns an error, every snapshotted range is
//! restored and every allocation made inside the transaction is released.
//! On success the accumulated dirty ranges are written through to the
//! backing file before any commit callback runs.
//!
//! The callback registry keeps, per stage, two ordered sequences: a forward
//! list appended to by [`Tx::push_back`] and run in FIFO order, and a
//! backward list filled by [`Tx::push_front`] and run in LIFO order, the
//! backward list first. This is what lets callers release locks in the
//! reverse order of acquisition no matter whether the transaction commits
//! or aborts. Registering a callback outside the work stage is a bug and
//! panics.

use std::cell::{Cell, RefCell};
use std::mem;

use array_macro::array;
use itertools::Itertools;

use super::{Obj, ObjPool};
use crate::error::Result;

/// Stages of a transaction's life, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Stage {
    Work = 0,
    OnCommit = 1,
    OnAbort = 2,
    Finally = 3,
    None = 4,
}

const NSTAGES: usize = 5;

type Callback = Box<dyn FnOnce()>;

/// Forward (FIFO) and backward (LIFO) callback sequences for one stage.
#[derive(Default)]
struct CallbackList {
    forward: Vec<Callback>,
    backward: Vec<Callback>,
}

struct TxInner {
    /// Pre-images, replayed in reverse on abort.
    undo: Vec<(u64, Box<[u8]>)>,
    /// Ranges to write through on commit.
    dirty: Vec<(u64, u64)>,
    /// Payload offsets allocated by this transaction; released on abort.
    allocs: Vec<u64>,
    /// Payload offsets freed by this transaction; released on commit.
    frees: Vec<u64>,
    stages: [CallbackList; NSTAGES],
}

pub struct Tx<'p> {
    pool: &'p ObjPool,
    stage: Cell<Stage>,
    inner: RefCell<TxInner>,
}

impl<'p> Tx<'p> {
    pub(super) fn begin(pool: &'p ObjPool) -> Self {
        Self {
            pool,
            stage: Cell::new(Stage::Work),
            inner: RefCell::new(TxInner {
                undo: Vec::new(),
                dirty: Vec::new(),
                allocs: Vec::new(),
                frees: Vec::new(),
                stages: array![_ => CallbackList::default(); NSTAGES],
            }),
        }
    }

    pub fn pool(&self) -> &'p ObjPool {
        self.pool
    }

    pub fn stage(&self) -> Stage {
        self.stage.get()
    }

    /// Registers `f` on `stage`'s forward list, run in registration order.
    pub fn push_back(&self, stage: Stage, f: impl FnOnce() + 'static) {
        assert_eq!(
            self.stage.get(),
            Stage::Work,
            "stage callback registered outside the work stage"
        );
        self.inner.borrow_mut().stages[stage as usize]
            .forward
            .push(Box::new(f));
    }

    /// Registers `f` on `stage`'s backward list, run in reverse registration
    /// order, before the forward list.
    pub fn push_front(&self, stage: Stage, f: impl FnOnce() + 'static) {
        assert_eq!(
            self.stage.get(),
            Stage::Work,
            "stage callback registered outside the work stage"
        );
        self.inner.borrow_mut().stages[stage as usize]
            .backward
            .push(Box::new(f));
    }

    /// Snapshots `len` bytes at `off` for rollback and marks them dirty.
    pub fn add_range(&self, off: u64, len: usize) {
        let mut image = vec![0u8; len].into_boxed_slice();
        self.pool.read_bytes(off, &mut image);
        let mut inner = self.inner.borrow_mut();
        inner.undo.push((off, image));
        inner.dirty.push((off, len as u64));
    }

    /// Snapshots the whole object.
    pub fn add<T>(&self, obj: Obj<T>) {
        self.add_range(obj.off(), mem::size_of::<T>());
    }

    /// Snapshots `len` bytes of a field at byte offset `field` inside `obj`.
    pub fn add_field<T>(&self, obj: Obj<T>, field: usize, len: usize) {
        self.add_range(obj.field_off(field), len);
    }

    /// Marks a range dirty without snapshotting it. For bytes that carry no
    /// observable data yet (fresh allocations, zero fill).
    pub fn mark_dirty(&self, off: u64, len: usize) {
        self.inner.borrow_mut().dirty.push((off, len as u64));
    }

    /// Allocates a zeroed `T`, rolled back if the transaction aborts.
    pub fn zalloc<T>(&self, type_num: u64) -> Result<Obj<T>> {
        let payload = self.pool.alloc_raw(mem::size_of::<T>(), type_num)?;
        self.pool.memset_persist(payload, 0, mem::size_of::<T>());
        self.inner.borrow_mut().allocs.push(payload);
        Ok(Obj::from_off(payload))
    }

    /// Allocates `size` raw bytes, rolled back on abort. Returns the payload
    /// offset and the usable size the allocator actually provided.
    pub fn alloc_data(&self, size: usize, type_num: u64) -> Result<(u64, usize)> {
        let payload = self.pool.alloc_raw(size, type_num)?;
        self.inner.borrow_mut().allocs.push(payload);
        Ok((payload, self.pool.usable_size(payload)))
    }

    /// Schedules the chunk holding `payload` for release at commit. An abort
    /// keeps it allocated.
    pub fn free_at(&self, payload: u64) {
        self.inner.borrow_mut().frees.push(payload);
    }

    /// Schedules the object's chunk for release at commit.
    pub fn free<T>(&self, obj: Obj<T>) {
        self.free_at(obj.off());
    }

    fn run_stage(&self, stage: Stage) {
        self.stage.set(stage);
        let (mut backward, forward) = {
            let mut inner = self.inner.borrow_mut();
            let list = &mut inner.stages[stage as usize];
            (mem::take(&mut list.backward), mem::take(&mut list.forward))
        };
        while let Some(cb) = backward.pop() {
            cb();
        }
        for cb in forward {
            cb();
        }
    }

    pub(super) fn commit(self) {
        {
            let mut inner = self.inner.borrow_mut();
            for payload in mem::take(&mut inner.frees) {
                self.pool.free_raw(payload);
            }
            let mut dirty = mem::take(&mut inner.dirty);
            drop(inner);

            dirty.sort_unstable();
            let merged = dirty.into_iter().coalesce(|a, b| {
                if b.0 <= a.0 + a.1 {
                    Ok((a.0, (b.0 + b.1).max(a.0 + a.1) - a.0))
                } else {
                    Err((a, b))
                }
            });
            for (off, len) in merged {
                self.pool.persist(off, len as usize);
            }
        }
        self.run_stage(Stage::OnCommit);
        self.run_stage(Stage::Finally);
        self.run_stage(Stage::None);
    }

    pub(super) fn rollback(self) {
        {
            let mut inner = self.inner.borrow_mut();
            let undo = mem::take(&mut inner.undo);
            let allocs = mem::take(&mut inner.allocs);
            drop(inner);

            // Restore pre-images newest first and write them through, so the
            // file again matches the last committed state even where the
            // transaction had persisted over it.
            for (off, image) in undo.into_iter().rev() {
                self.pool.memcpy_persist(off, &image);
            }
            for payload in allocs {
                self.pool.free_raw(payload);
            }
        }
        self.run_stage(Stage::OnAbort);
        self.run_stage(Stage::Finally);
        self.run_stage(Stage::None);
    }
}
