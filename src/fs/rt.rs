//! Runtime state and the volatile-pointer overlay.
//!
//! On-media objects outlive any single process, but some of their state is
//! inherently per-session: locks, reference counters, the opened-inodes
//! bookkeeping. That state hangs off the object's [`VPtr`] slot, keyed by
//! the pool's generation id (`run_id`, bumped by 2 on every open, so it is
//! always even).
//!
//! For a pool generation `R` the slot's own `run_id` word is a tiny state
//! machine:
//!
//! | slot value | meaning                              |
//! |------------|--------------------------------------|
//! | `R`        | `data` points at live runtime state  |
//! | `R − 1`    | construction in progress, wait       |
//! | anything else | stale or never initialised        |
//!
//! [`vptr_get`] is the race-free lazy allocator over that state machine:
//! claim the slot by CASing the stale value to `R − 1`, run the
//! constructor, publish `R` (or `R − 2` if construction failed, so the next
//! caller retries). The same claim step doubles as the mutual exclusion for
//! reference-count manipulation during teardown; see the inode module.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::config::Config;
use crate::fs::layout::{Dir, Inode, InodeArray, Super, VPTR_DATA_OFF, VPTR_RUN_ID_OFF};
use crate::lock::NodeLock;
use crate::obj::{Obj, ObjPool};

/// Types attachable to a vptr slot. The only shared requirement is the
/// reference counter.
pub trait Runtime {
    fn refcnt(&self) -> &AtomicU32;
}

/// Where an inode is registered in the opened-inodes chain.
#[derive(Debug, Clone, Copy)]
pub struct OpenedSlot {
    pub arr: Obj<InodeArray>,
    pub idx: usize,
}

/// Per-session state of one inode.
pub struct InodeRt {
    pub refcnt: AtomicU32,
    pub lock: NodeLock,
    pub inode: Obj<Inode>,

    /// Registration in the opened-inodes chain, if any. Mutated under the
    /// inode write lock.
    pub opened: Mutex<Option<OpenedSlot>>,

    /// One of the full paths the inode can be reached by. Log lines only.
    pub path: Mutex<Option<String>>,
}

impl InodeRt {
    fn new(inode: Obj<Inode>, cfg: &Config) -> Box<Self> {
        Box::new(Self {
            refcnt: AtomicU32::new(0),
            lock: NodeLock::new(cfg.contention_level),
            inode,
            opened: Mutex::new(None),
            path: Mutex::new(None),
        })
    }

    /// Debug path for log lines; "?" until one is recorded.
    pub fn path_str(&self) -> String {
        self.path.lock().clone().unwrap_or_else(|| "?".to_string())
    }
}

impl Runtime for InodeRt {
    fn refcnt(&self) -> &AtomicU32 {
        &self.refcnt
    }
}

/// Per-session state of the superblock.
pub struct SuperRt {
    pub refcnt: AtomicU32,
    pub lock: NodeLock,
    pub superblock: Obj<Super>,
}

impl Runtime for SuperRt {
    fn refcnt(&self) -> &AtomicU32 {
        &self.refcnt
    }
}

/// Per-session state of one directory node.
pub struct DirRt {
    pub refcnt: AtomicU32,
    pub dir: Obj<Dir>,
}

impl Runtime for DirRt {
    fn refcnt(&self) -> &AtomicU32 {
        &self.refcnt
    }
}

/// Race-free lazy allocator of runtime state.
///
/// `vptr_off` is the pool offset of the object's [`VPtr`] slot and
/// `pool_run_id` the pool's current generation. When `take_ref` is set the
/// reference counter is incremented while the slot is claimed, so the
/// increment can never race with teardown.
///
/// Returns a raw pointer rather than a reference: the pointee lives until a
/// teardown transaction observes its reference count at zero, which the
/// callers' reference discipline prevents while the pointer is in use.
pub(crate) fn vptr_get<T: Runtime>(
    pool: &ObjPool,
    pool_run_id: u64,
    vptr_off: u64,
    ctor: impl Fn() -> Option<Box<T>>,
    mut take_ref: bool,
) -> Option<*mut T> {
    let run_id = pool.atomic_u64(vptr_off + VPTR_RUN_ID_OFF as u64);
    let data = pool.atomic_u64(vptr_off + VPTR_DATA_OFF as u64);

    loop {
        let cur = run_id.load(Ordering::Acquire);
        if cur == pool_run_id && !take_ref {
            let ptr = data.load(Ordering::Acquire) as *mut T;
            return if ptr.is_null() { None } else { Some(ptr) };
        }

        // Construction (or teardown) in progress on another thread.
        if cur == pool_run_id - 1 {
            thread::yield_now();
            continue;
        }

        // Claim the slot. Losing the race just means trying again later.
        if run_id
            .compare_exchange(cur, pool_run_id - 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            thread::yield_now();
            continue;
        }

        // We hold the slot. A stale generation means the runtime state has
        // not been built this session; build it. On failure `data` stays
        // nil and the published generation makes the next caller retry.
        if cur != pool_run_id {
            let fresh = match ctor() {
                Some(boxed) => Box::into_raw(boxed) as u64,
                None => 0,
            };
            data.store(fresh, Ordering::Release);
        }

        let ptr = data.load(Ordering::Relaxed) as *mut T;
        if take_ref && !ptr.is_null() {
            // SAFETY: `ptr` was published by Box::into_raw and cannot be
            // destroyed while we hold the slot.
            unsafe { &*ptr }.refcnt().fetch_add(1, Ordering::SeqCst);
            take_ref = false;
        }

        let new_run_id = if ptr.is_null() {
            pool_run_id - 2
        } else {
            pool_run_id
        };
        run_id
            .compare_exchange(pool_run_id - 1, new_run_id, Ordering::AcqRel, Ordering::Acquire)
            .expect("generation publish raced");
    }
}

fn vptr_fast_path<T>(pool: &ObjPool, pool_run_id: u64, vptr_off: u64) -> Option<*mut T> {
    let run_id = pool.atomic_u64(vptr_off + VPTR_RUN_ID_OFF as u64);
    if run_id.load(Ordering::Acquire) != pool_run_id {
        return None;
    }
    let data = pool.atomic_u64(vptr_off + VPTR_DATA_OFF as u64);
    let ptr = data.load(Ordering::Acquire) as *mut T;
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Runtime state of an inode, built on first access this session.
pub(crate) fn inode_get<'p>(
    pool: &'p ObjPool,
    run_id: u64,
    cfg: &Config,
    inode: Obj<Inode>,
) -> &'p InodeRt {
    let ptr = vptr_fast_path(pool, run_id, inode.off()).unwrap_or_else(|| {
        let cfg = *cfg;
        vptr_get(pool, run_id, inode.off(), || Some(InodeRt::new(inode, &cfg)), false)
            .expect("inode runtime construction failed")
    });
    // SAFETY: see vptr_get's pointer validity contract.
    unsafe { &*ptr }
}

/// Like [`inode_get`], additionally taking a reference.
pub(crate) fn inode_ref<'p>(
    pool: &'p ObjPool,
    run_id: u64,
    cfg: &Config,
    inode: Obj<Inode>,
) -> &'p InodeRt {
    let cfg2 = *cfg;
    let ptr = vptr_get(pool, run_id, inode.off(), || Some(InodeRt::new(inode, &cfg2)), true)
        .expect("inode runtime construction failed");
    log::debug!("inode {:#x} ref", inode.off());
    // SAFETY: see vptr_get's pointer validity contract.
    unsafe { &*ptr }
}

/// Runtime state of the superblock.
pub(crate) fn super_get<'p>(
    pool: &'p ObjPool,
    run_id: u64,
    cfg: &Config,
    superblock: Obj<Super>,
) -> &'p SuperRt {
    let ptr = vptr_fast_path(pool, run_id, superblock.off()).unwrap_or_else(|| {
        let level = cfg.contention_level;
        vptr_get(
            pool,
            run_id,
            superblock.off(),
            || {
                Some(Box::new(SuperRt {
                    refcnt: AtomicU32::new(0),
                    lock: NodeLock::new(level),
                    superblock,
                }))
            },
            false,
        )
        .expect("superblock runtime construction failed")
    });
    // SAFETY: see vptr_get's pointer validity contract.
    unsafe { &*ptr }
}

/// Runtime state of a directory node.
pub(crate) fn dir_get<'p>(pool: &'p ObjPool, run_id: u64, dir: Obj<Dir>) -> &'p DirRt {
    let ptr = vptr_fast_path(pool, run_id, dir.off()).unwrap_or_else(|| {
        vptr_get(
            pool,
            run_id,
            dir.off(),
            || {
                Some(Box::new(DirRt {
                    refcnt: AtomicU32::new(0),
                    dir,
                }))
            },
            false,
        )
        .expect("directory runtime construction failed")
    });
    // SAFETY: see vptr_get's pointer validity contract.
    unsafe { &*ptr }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::test_util::TempPath;

    struct Probe {
        refcnt: AtomicU32,
        tag: u64,
    }

    impl Runtime for Probe {
        fn refcnt(&self) -> &AtomicU32 {
            &self.refcnt
        }
    }

    #[test]
    fn constructs_once_per_generation() {
        let path = TempPath::new("vptr_once");
        let pool = ObjPool::create(path.as_path(), 1 << 20, 0o600).unwrap();
        let slot = pool.alloc_raw(16, 0).unwrap();
        pool.memset_persist(slot, 0, 16);

        let built = Arc::new(AtomicUsize::new(0));
        let make = |tag: u64, built: &Arc<AtomicUsize>| {
            let built = Arc::clone(built);
            move || {
                built.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(Probe {
                    refcnt: AtomicU32::new(0),
                    tag,
                }))
            }
        };

        let p1 = vptr_get(&pool, 4, slot, make(11, &built), false).unwrap();
        let p2 = vptr_get(&pool, 4, slot, make(22, &built), true).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        // SAFETY: just constructed, never destroyed in this test.
        assert_eq!(unsafe { &*p1 }.tag, 11);
        assert_eq!(unsafe { &*p1 }.refcnt.load(Ordering::SeqCst), 1);

        // A new generation rebuilds.
        let p3 = vptr_get(&pool, 6, slot, make(33, &built), false).unwrap();
        assert_ne!(unsafe { &*p3 }.tag, 11);
        assert_eq!(built.load(Ordering::SeqCst), 2);

        // Reclaim the leaked probes.
        unsafe {
            drop(Box::from_raw(p1));
            drop(Box::from_raw(p3));
        }
    }

    #[test]
    fn failed_construction_publishes_retry_state() {
        let path = TempPath::new("vptr_fail");
        let pool = ObjPool::create(path.as_path(), 1 << 20, 0o600).unwrap();
        let slot = pool.alloc_raw(16, 0).unwrap();
        pool.memset_persist(slot, 0, 16);

        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = Arc::clone(&attempts);
        // Fails once, then succeeds; the loop must retry transparently.
        let flaky = move || {
            if a2.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                Some(Box::new(Probe {
                    refcnt: AtomicU32::new(0),
                    tag: 7,
                }))
            }
        };
        let p = vptr_get(&pool, 4, slot, flaky, false).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // SAFETY: constructed above.
        unsafe { drop(Box::from_raw(p)) };
    }

    #[test]
    fn concurrent_getters_agree() {
        let path = TempPath::new("vptr_race");
        let pool = Arc::new(ObjPool::create(path.as_path(), 1 << 20, 0o600).unwrap());
        let slot = pool.alloc_raw(16, 0).unwrap();
        pool.memset_persist(slot, 0, 16);

        let built = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let built = Arc::clone(&built);
            handles.push(std::thread::spawn(move || {
                let ctor = || {
                    built.fetch_add(1, Ordering::SeqCst);
                    Some(Box::new(Probe {
                        refcnt: AtomicU32::new(0),
                        tag: 1,
                    }))
                };
                vptr_get(&pool, 4, slot, ctor, true).unwrap() as usize
            }));
        }
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(built.load(Ordering::SeqCst), 1, "constructor raced");

        let p = ptrs[0] as *mut Probe;
        // SAFETY: all getters returned this pointer.
        assert_eq!(unsafe { &*p }.refcnt.load(Ordering::SeqCst), 8);
        unsafe { drop(Box::from_raw(p)) };
    }
}
