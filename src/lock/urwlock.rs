//! User-space readers/writer lock.
//!
//! The whole lock is one atomic word: the low 32 bits count readers, bit 32
//! is the writer flag. Readers CAS-increment the count and therefore fail
//! (and retry) whenever the writer bit is set; the writer CASes the whole
//! word from zero. No fairness, no sleeping; contention is burned in a spin.

use std::sync::atomic::{AtomicU64, Ordering};

const WRITER: u64 = 1 << 32;
const READERS: u64 = WRITER - 1;

pub struct URwLock {
    data: AtomicU64,
}

impl Default for URwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl URwLock {
    pub const fn new() -> Self {
        Self {
            data: AtomicU64::new(0),
        }
    }

    pub fn rlock(&self) {
        loop {
            let old = self.data.load(Ordering::Relaxed) & READERS;
            if self
                .data
                .compare_exchange_weak(old, old + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub fn wlock(&self) {
        while self
            .data
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Releases whichever side is held.
    pub fn unlock(&self) {
        if self.data.load(Ordering::Relaxed) & WRITER != 0 {
            self.data
                .compare_exchange(WRITER, 0, Ordering::Release, Ordering::Relaxed)
                .expect("writer unlock raced");
        } else {
            loop {
                let old = self.data.load(Ordering::Relaxed) & READERS;
                debug_assert!(old > 0, "reader unlock without readers");
                if self
                    .data
                    .compare_exchange_weak(old, old - 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn readers_share_writer_excludes() {
        let lock = URwLock::new();
        lock.rlock();
        lock.rlock();
        assert_eq!(lock.data.load(Ordering::SeqCst), 2);
        lock.unlock();
        lock.unlock();

        lock.wlock();
        assert_eq!(lock.data.load(Ordering::SeqCst), WRITER);
        lock.unlock();
        assert_eq!(lock.data.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn writer_waits_for_readers() {
        let lock = Arc::new(URwLock::new());
        lock.rlock();

        let l2 = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            l2.wlock();
            l2.unlock();
        });

        // Let the writer spin a moment, then release it.
        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.unlock();
        writer.join().unwrap();
        assert_eq!(lock.data.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn counts_many_readers() {
        let lock = Arc::new(URwLock::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let l = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        l.rlock();
                        l.unlock();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(lock.data.load(Ordering::SeqCst), 0);
    }
}
