//! Process-shared synchronization primitives.
//!
//! Each primitive is a single futex word with a fixed `repr(C)` layout, so it
//! can be placed at a known offset inside the shared arena and operated on
//! from either process. No flag marks them process-private; the kernel keys
//! the futex on the underlying physical page.

use rustix::io::Errno;
use rustix::thread::futex;
use rustix::time::Timespec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

fn timespec(duration: Duration) -> Timespec {
    Timespec {
        tv_sec: duration.as_secs() as i64,
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// A mutex shareable between processes through mapped memory.
///
/// State word: 0 unlocked, 1 locked, 2 locked with waiters.
#[repr(C)]
pub struct SharedMutex {
    state: AtomicU32,
}

impl SharedMutex {
    /// Create an unlocked mutex (for process-local use; in the arena the
    /// zeroed allocation already is one).
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(UNLOCKED) }
    }

    /// Force the mutex back to the unlocked state in place.
    ///
    /// Used when reconstructing rendezvous state over memory that a dead
    /// peer may have left locked.
    pub fn reset(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Try to take the lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the lock, blocking without bound.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            let _ = futex::wait(&self.state, futex::Flags::empty(), CONTENDED, None);
        }
    }

    /// Take the lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        if self.try_lock() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match futex::wait(&self.state, futex::Flags::empty(), CONTENDED, Some(&timespec(remaining))) {
                Ok(()) | Err(Errno::AGAIN) | Err(Errno::INTR) => {}
                Err(_) => return false,
            }
        }
    }

    /// Release the lock, waking one waiter if any queued up.
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let _ = futex::wake(&self.state, futex::Flags::empty(), 1);
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition variable shareable between processes.
///
/// The sequence word is bumped on every notification; a waiter that loads
/// the sequence while still holding the mutex cannot miss a notification
/// that lands between releasing the mutex and entering the kernel wait.
#[repr(C)]
pub struct SharedCondvar {
    seq: AtomicU32,
}

impl SharedCondvar {
    /// Create a condition variable.
    pub const fn new() -> Self {
        Self { seq: AtomicU32::new(0) }
    }

    /// Reset the notification state in place.
    pub fn reset(&self) {
        self.seq.store(0, Ordering::Release);
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        let _ = futex::wake(&self.seq, futex::Flags::empty(), 1);
    }

    /// Release `mutex`, wait for a notification, then reacquire `mutex`.
    ///
    /// Returns true when a notification arrived within `timeout`. The mutex
    /// is held again on return either way.
    pub fn wait_timeout(&self, mutex: &SharedMutex, timeout: Duration) -> bool {
        let seq = self.seq.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;
        mutex.unlock();
        let notified = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break false;
            }
            match futex::wait(&self.seq, futex::Flags::empty(), seq, Some(&timespec(remaining))) {
                Ok(()) | Err(Errno::AGAIN) => break true,
                Err(Errno::INTR) => continue,
                Err(_) => break false,
            }
        };
        mutex.lock();
        notified
    }

    /// Release `mutex` and wait without bound, then reacquire it.
    pub fn wait(&self, mutex: &SharedMutex) {
        let seq = self.seq.load(Ordering::Acquire);
        mutex.unlock();
        loop {
            match futex::wait(&self.seq, futex::Flags::empty(), seq, None) {
                Ok(()) | Err(Errno::AGAIN) => break,
                Err(Errno::INTR) => continue,
                Err(_) => break,
            }
        }
        mutex.lock();
    }
}

impl Default for SharedCondvar {
    fn default() -> Self {
        Self::new()
    }
}
