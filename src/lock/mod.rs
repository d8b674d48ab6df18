//! The lock module.
//!
//! One configuration value, the contention level, picks a lock
//! implementation for the whole library:
//!
//! | level | node locks (inode, superblock) | file-handle locks |
//! |-------|--------------------------------|-------------------|
//! | 0     | none                           | none              |
//! | 1     | spin                           | spin              |
//! | 2     | spin (try + yield)             | spin (try + yield)|
//! | 3     | user-space rwlock              | spin (try + yield)|
//! | 4     | user-space rwlock              | OS mutex          |
//! | 5     | OS rwlock                      | OS mutex          |
//!
//! All locks expose raw lock/unlock so that a release can be postponed into
//! a transaction stage callback: `tx_wlock` acquires now and schedules the
//! release on abort, `tx_unlock_on_commit` schedules the pairing release on
//! commit. Whichever way the transaction ends, the lock is dropped exactly
//! once, in the reverse order of acquisition.
//!
//! The opened-inodes arrays use [`PMutex`], a mutex living on media. Its
//! state from a previous pool generation is meaningless, so it carries a
//! generation word revived with the same three-state protocol as the
//! volatile-pointer slots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::lock_api::{RawMutex as RawMutexApi, RawRwLock as RawRwLockApi};

use crate::obj::{Stage, Tx};

mod urwlock;

pub use urwlock::URwLock;

/// Plain test-and-set spinlock.
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    /// Like [`lock`](Self::lock), but yields the CPU between attempts.
    pub fn lock_yield(&self) {
        while !self.try_lock() {
            std::thread::yield_now();
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

enum NodeLockImpl {
    None,
    Spin(RawSpinlock),
    SpinYield(RawSpinlock),
    URw(URwLock),
    Rw(parking_lot::RawRwLock),
}

/// Readers/writer lock guarding one runtime-state object (inode or
/// superblock), implementation chosen by the contention level.
pub struct NodeLock {
    imp: NodeLockImpl,
}

impl NodeLock {
    pub fn new(contention_level: u8) -> Self {
        let imp = match contention_level {
            0 => NodeLockImpl::None,
            1 => NodeLockImpl::Spin(RawSpinlock::new()),
            2 => NodeLockImpl::SpinYield(RawSpinlock::new()),
            3 | 4 => NodeLockImpl::URw(URwLock::new()),
            5 => NodeLockImpl::Rw(<parking_lot::RawRwLock as RawRwLockApi>::INIT),
            _ => unreachable!("contention level validated at configuration"),
        };
        Self { imp }
    }

    pub fn rlock(&self) {
        match &self.imp {
            NodeLockImpl::None => {}
            NodeLockImpl::Spin(l) => l.lock(),
            NodeLockImpl::SpinYield(l) => l.lock_yield(),
            NodeLockImpl::URw(l) => l.rlock(),
            NodeLockImpl::Rw(l) => l.lock_shared(),
        }
    }

    pub fn runlock(&self) {
        match &self.imp {
            NodeLockImpl::None => {}
            NodeLockImpl::Spin(l) | NodeLockImpl::SpinYield(l) => l.unlock(),
            NodeLockImpl::URw(l) => l.unlock(),
            // SAFETY: paired with rlock on this thread.
            NodeLockImpl::Rw(l) => unsafe { l.unlock_shared() },
        }
    }

    pub fn wlock(&self) {
        match &self.imp {
            NodeLockImpl::None => {}
            NodeLockImpl::Spin(l) => l.lock(),
            NodeLockImpl::SpinYield(l) => l.lock_yield(),
            NodeLockImpl::URw(l) => l.wlock(),
            NodeLockImpl::Rw(l) => l.lock_exclusive(),
        }
    }

    pub fn wunlock(&self) {
        match &self.imp {
            NodeLockImpl::None => {}
            NodeLockImpl::Spin(l) | NodeLockImpl::SpinYield(l) => l.unlock(),
            NodeLockImpl::URw(l) => l.unlock(),
            // SAFETY: paired with wlock on this thread.
            NodeLockImpl::Rw(l) => unsafe { l.unlock_exclusive() },
        }
    }

    /// Write-locks now and schedules the release for transaction abort.
    ///
    /// The lock must outlive the transaction; node locks live in runtime
    /// state that is only destroyed through commit callbacks registered
    /// after this one, so the address stays valid.
    pub fn tx_wlock(&self, tx: &Tx<'_>) {
        self.wlock();
        let lock = self as *const NodeLock as usize;
        tx.push_front(Stage::OnAbort, move || {
            // SAFETY: see above; the runtime object holding the lock is kept
            // alive at least until the transaction ends.
            unsafe { &*(lock as *const NodeLock) }.wunlock();
        });
    }

    /// Schedules the release pairing an earlier [`tx_wlock`](Self::tx_wlock)
    /// for transaction commit.
    pub fn tx_unlock_on_commit(&self, tx: &Tx<'_>) {
        let lock = self as *const NodeLock as usize;
        tx.push_back(Stage::OnCommit, move || {
            // SAFETY: as in tx_wlock.
            unsafe { &*(lock as *const NodeLock) }.wunlock();
        });
    }
}

enum HandleLockImpl {
    None,
    Spin(RawSpinlock),
    SpinYield(RawSpinlock),
    Mutex(parking_lot::RawMutex),
}

/// Mutex guarding one open file handle's offset and position cache.
pub struct HandleLock {
    imp: HandleLockImpl,
}

impl HandleLock {
    pub fn new(contention_level: u8) -> Self {
        let imp = match contention_level {
            0 => HandleLockImpl::None,
            1 => HandleLockImpl::Spin(RawSpinlock::new()),
            2 | 3 => HandleLockImpl::SpinYield(RawSpinlock::new()),
            4 | 5 => HandleLockImpl::Mutex(<parking_lot::RawMutex as RawMutexApi>::INIT),
            _ => unreachable!("contention level validated at configuration"),
        };
        Self { imp }
    }

    pub fn lock(&self) {
        match &self.imp {
            HandleLockImpl::None => {}
            HandleLockImpl::Spin(l) => l.lock(),
            HandleLockImpl::SpinYield(l) => l.lock_yield(),
            HandleLockImpl::Mutex(l) => l.lock(),
        }
    }

    pub fn unlock(&self) {
        match &self.imp {
            HandleLockImpl::None => {}
            HandleLockImpl::Spin(l) | HandleLockImpl::SpinYield(l) => l.unlock(),
            // SAFETY: paired with lock on this thread.
            HandleLockImpl::Mutex(l) => unsafe { l.unlock() },
        }
    }
}

/// Mutex living on media, embedded at offset 0 of every opened-inodes array.
///
/// The generation word distinguishes live state from a previous session's
/// leftovers: `run_id` means initialised for this session, `run_id - 1`
/// means a thread is resetting it, anything else is stale.
#[repr(C)]
pub struct PMutex {
    gen: AtomicU64,
    word: AtomicU64,
}

impl PMutex {
    pub fn lock(&self, run_id: u64) {
        loop {
            let gen = self.gen.load(Ordering::Acquire);
            if gen == run_id {
                if self
                    .word
                    .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                std::thread::yield_now();
                continue;
            }
            if gen == run_id - 1 {
                // Another thread is reviving the mutex.
                std::hint::spin_loop();
                continue;
            }
            // Stale generation: revive it, taking the lock in the process.
            if self
                .gen
                .compare_exchange(gen, run_id - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.word.store(1, Ordering::Relaxed);
                self.gen.store(run_id, Ordering::Release);
                return;
            }
        }
    }

    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Locks now and schedules the release for transaction abort.
    pub fn tx_lock(&self, tx: &Tx<'_>, run_id: u64) {
        self.lock(run_id);
        self.unlock_on_abort(tx);
    }

    /// Schedules a release on abort for a lock acquired manually.
    ///
    /// The mutex lives on media, which outlives every transaction.
    pub fn unlock_on_abort(&self, tx: &Tx<'_>) {
        let mtx = self as *const PMutex as usize;
        tx.push_front(Stage::OnAbort, move || {
            // SAFETY: media-resident, outlives the transaction.
            unsafe { &*(mtx as *const PMutex) }.unlock();
        });
    }

    /// Schedules the pairing release for transaction commit.
    pub fn unlock_on_commit(&self, tx: &Tx<'_>) {
        let mtx = self as *const PMutex as usize;
        tx.push_back(Stage::OnCommit, move || {
            // SAFETY: media-resident, outlives the transaction.
            unsafe { &*(mtx as *const PMutex) }.unlock();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObjPool;
    use crate::test_util::TempPath;

    #[test]
    fn pmutex_revives_across_generations() {
        let m = PMutex {
            gen: AtomicU64::new(0xdead),
            word: AtomicU64::new(0xbeef),
        };
        m.lock(4);
        assert_eq!(m.gen.load(Ordering::SeqCst), 4);
        assert_eq!(m.word.load(Ordering::SeqCst), 1);
        m.unlock();

        // Same generation: plain lock this time.
        m.lock(4);
        m.unlock();

        // Next pool open: stale again.
        m.lock(6);
        assert_eq!(m.gen.load(Ordering::SeqCst), 6);
        m.unlock();
    }

    #[test]
    fn tx_wlock_released_on_abort_and_commit() {
        let path = TempPath::new("lock_tx");
        let pool = ObjPool::create(path.as_path(), 1 << 20, 0o600).unwrap();
        let lock = Box::leak(Box::new(NodeLock::new(5)));

        let res: crate::error::Result<()> = pool.tx(|tx| {
            lock.tx_wlock(tx);
            Err(crate::error::Error::Invalid)
        });
        assert!(res.is_err());
        // Released on abort: a fresh wlock must not deadlock.
        lock.wlock();
        lock.wunlock();

        pool.tx(|tx| {
            lock.tx_wlock(tx);
            lock.tx_unlock_on_commit(tx);
            Ok(())
        })
        .unwrap();
        lock.wlock();
        lock.wunlock();
    }
}
