//! Cross-process rendezvous between the host and its stub.
//!
//! Three mutexes, two condition variables and one liveness flag, all placed
//! inside the arena so both processes see them. The protocol serializes one
//! execution at a time:
//!
//! 1. the host writes the request batch offset and signals the stub condition;
//! 2. the stub raises the health flag, computes, writes the response batch
//!    offset, and signals the parent condition;
//! 3. the host, which holds the parent mutex for the lifetime of the
//!    instance, waits on the parent condition in bounded slices and probes
//!    the health flag between slices to detect a dead or frozen peer.
//!
//! Timeouts never mean success; any bound that expires marks the stub lost.

use super::sync::{SharedCondvar, SharedMutex};
use crate::error::{Error, Result};
use crate::memory::{Arena, ShmRecord};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Bound on individual lock acquisitions and wait slices.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The synchronization primitives shared by host and stub.
#[repr(C)]
pub struct RendezvousBlock {
    stub_mutex: SharedMutex,
    parent_mutex: SharedMutex,
    health_mutex: SharedMutex,
    stub_cond: SharedCondvar,
    parent_cond: SharedCondvar,
}

// SAFETY: futex words and atomics; every bit pattern (zero = all unlocked)
// is a valid state.
unsafe impl ShmRecord for RendezvousBlock {}

/// The fixed record both sides exchange batch offsets through.
#[repr(C)]
pub struct IpcMessage {
    request_batch: AtomicU64,
    response_batch: AtomicU64,
    health: AtomicU32,
    _pad: u32,
}

// SAFETY: plain atomics, zero-valid.
unsafe impl ShmRecord for IpcMessage {}

/// Host-side handle to the rendezvous state.
///
/// Holds the parent mutex for its whole lifetime; the lock is only released
/// inside a condition wait, or explicitly right before arena teardown.
pub struct Rendezvous {
    block: NonNull<RendezvousBlock>,
    ipc: NonNull<IpcMessage>,
    parent_held: bool,
}

// SAFETY: the pointed-to state is process-shared atomics inside the arena,
// valid for the arena's lifetime, which the owning instance guarantees
// outlives this handle.
unsafe impl Send for Rendezvous {}

impl Rendezvous {
    /// Allocate and initialize the rendezvous state inside `arena`, publish
    /// its offsets in the arena header, and take the long-lived parent lock.
    pub fn new(arena: &Arena) -> Result<Self> {
        let (block_offset, block) = arena.alloc_record::<RendezvousBlock>()?;
        let (ipc_offset, ipc) = arena.alloc_record::<IpcMessage>()?;
        arena.set_rendezvous_offsets(block_offset, ipc_offset);

        let mut rendezvous = Self {
            block: NonNull::from(block),
            ipc: NonNull::from(ipc),
            parent_held: false,
        };
        rendezvous.block().parent_mutex.lock();
        rendezvous.parent_held = true;
        Ok(rendezvous)
    }

    fn block(&self) -> &RendezvousBlock {
        // SAFETY: allocated in the arena's first mapping, never unmapped
        // while the instance lives.
        unsafe { self.block.as_ref() }
    }

    fn ipc(&self) -> &IpcMessage {
        // SAFETY: as above.
        unsafe { self.ipc.as_ref() }
    }

    /// Reinitialize the stub-facing primitives in place for a restart.
    ///
    /// The parent mutex and condition keep their state: the host still holds
    /// the parent lock across stub generations, and the memory slots must not
    /// move because the next stub resolves them at the same offsets.
    pub fn reset_stub_primitives(&self) {
        let block = self.block();
        block.stub_mutex.reset();
        block.health_mutex.reset();
        block.stub_cond.reset();
        self.ipc().health.store(0, Ordering::Release);
    }

    /// Wake the stub for the batch currently published in the IPC message.
    ///
    /// Returns false when the stub mutex cannot be acquired within a second,
    /// meaning the stub is stuck outside its wait loop.
    pub fn notify_stub(&self) -> bool {
        let block = self.block();
        if !block.stub_mutex.try_lock_for(PROBE_TIMEOUT) {
            return false;
        }
        block.stub_cond.notify_one();
        block.stub_mutex.unlock();
        true
    }

    /// Wait until the stub signals completion.
    ///
    /// Re-arms the health flag first; the stub must raise it again once it
    /// picks up the work. The wait itself has no overall bound: it runs in
    /// one-second slices and gives up only when the liveness probe fails.
    pub fn wait_for_stub(&self) -> bool {
        let block = self.block();
        if !block.health_mutex.try_lock_for(PROBE_TIMEOUT) {
            return false;
        }
        self.ipc().health.store(0, Ordering::Release);
        block.health_mutex.unlock();

        loop {
            if block.parent_cond.wait_timeout(&block.parent_mutex, PROBE_TIMEOUT) {
                return true;
            }
            if !self.is_stub_alive() {
                return false;
            }
        }
    }

    /// Probe the liveness flag.
    ///
    /// A health mutex that cannot be acquired within a second means the peer
    /// died or froze while holding it; both count as dead.
    pub fn is_stub_alive(&self) -> bool {
        let block = self.block();
        if !block.health_mutex.try_lock_for(PROBE_TIMEOUT) {
            return false;
        }
        let alive = self.ipc().health.load(Ordering::Acquire) != 0;
        block.health_mutex.unlock();
        alive
    }

    /// Lower the health flag under the health mutex.
    ///
    /// Returns false when the mutex cannot be acquired.
    pub fn clear_health(&self) -> bool {
        let block = self.block();
        if !block.health_mutex.try_lock_for(PROBE_TIMEOUT) {
            return false;
        }
        self.ipc().health.store(0, Ordering::Release);
        block.health_mutex.unlock();
        true
    }

    /// Wait once on the parent condition without touching the health flag.
    ///
    /// Used by the initialization handshake and the shutdown path, which
    /// manage liveness themselves.
    pub fn wait_parent(&self, timeout: Duration) -> bool {
        let block = self.block();
        block.parent_cond.wait_timeout(&block.parent_mutex, timeout)
    }

    /// Offset of the current request batch.
    pub fn request_batch(&self) -> u64 {
        self.ipc().request_batch.load(Ordering::Acquire)
    }

    /// Publish the offset of the next request batch.
    pub fn set_request_batch(&self, offset: u64) {
        self.ipc().request_batch.store(offset, Ordering::Release);
    }

    /// Offset of the response batch the stub last published.
    pub fn response_batch(&self) -> u64 {
        self.ipc().response_batch.load(Ordering::Acquire)
    }

    /// Release the long-lived parent lock.
    ///
    /// Must happen before the arena backing these primitives is torn down.
    pub fn release_parent_lock(&mut self) {
        if self.parent_held {
            self.block().parent_mutex.unlock();
            self.parent_held = false;
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.release_parent_lock();
    }
}

/// Stub-side handle to the rendezvous state.
///
/// A stub attaches the arena by name, resolves the offsets from the arena
/// header, and holds the stub mutex for its whole session, releasing it only
/// inside [`StubRendezvous::wait_for_work`]. This is what makes the host's
/// bounded `notify_stub` a liveness probe: the mutex is free exactly when the
/// stub is parked waiting for work.
pub struct StubRendezvous {
    block: NonNull<RendezvousBlock>,
    ipc: NonNull<IpcMessage>,
    stub_held: bool,
}

// SAFETY: as for Rendezvous.
unsafe impl Send for StubRendezvous {}

impl StubRendezvous {
    /// Attach to the rendezvous state of `arena` and take the stub lock.
    pub fn attach(arena: &Arena) -> Result<Self> {
        let (block_offset, ipc_offset) = arena.rendezvous_offsets();
        if block_offset == 0 || ipc_offset == 0 {
            return Err(Error::Arena("rendezvous state has not been initialized".into()));
        }
        let block = NonNull::from(arena.record_at::<RendezvousBlock>(block_offset)?);
        let ipc = NonNull::from(arena.record_at::<IpcMessage>(ipc_offset)?);

        let mut stub = Self { block, ipc, stub_held: false };
        stub.block().stub_mutex.lock();
        stub.stub_held = true;
        Ok(stub)
    }

    /// Attach without taking the stub lock, for observers that only publish
    /// health (a stub's health thread).
    pub fn attach_observer(arena: &Arena) -> Result<Self> {
        let (block_offset, ipc_offset) = arena.rendezvous_offsets();
        if block_offset == 0 || ipc_offset == 0 {
            return Err(Error::Arena("rendezvous state has not been initialized".into()));
        }
        Ok(Self {
            block: NonNull::from(arena.record_at::<RendezvousBlock>(block_offset)?),
            ipc: NonNull::from(arena.record_at::<IpcMessage>(ipc_offset)?),
            stub_held: false,
        })
    }

    fn block(&self) -> &RendezvousBlock {
        // SAFETY: as for Rendezvous.
        unsafe { self.block.as_ref() }
    }

    fn ipc(&self) -> &IpcMessage {
        // SAFETY: as for Rendezvous.
        unsafe { self.ipc.as_ref() }
    }

    /// Signal the parent condition.
    ///
    /// Serializes against the host through the parent mutex: the lock can
    /// only be acquired while the host is parked in a parent-condition wait.
    pub fn signal_parent(&self) {
        let block = self.block();
        let locked = block.parent_mutex.try_lock_for(PROBE_TIMEOUT);
        block.parent_cond.notify_one();
        if locked {
            block.parent_mutex.unlock();
        }
    }

    /// Park on the stub condition until the host posts work.
    ///
    /// Returns true when notified within `timeout`.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let block = self.block();
        block.stub_cond.wait_timeout(&block.stub_mutex, timeout)
    }

    /// Publish the liveness flag under the health mutex.
    pub fn set_health(&self, healthy: bool) -> bool {
        let block = self.block();
        if !block.health_mutex.try_lock_for(PROBE_TIMEOUT) {
            return false;
        }
        self.ipc().health.store(healthy as u32, Ordering::Release);
        block.health_mutex.unlock();
        true
    }

    /// Offset of the request batch the host published.
    pub fn request_batch(&self) -> u64 {
        self.ipc().request_batch.load(Ordering::Acquire)
    }

    /// Publish the offset of the finished response batch.
    pub fn set_response_batch(&self, offset: u64) {
        self.ipc().response_batch.store(offset, Ordering::Release);
    }

    /// Release the stub lock.
    pub fn release(&mut self) {
        if self.stub_held {
            self.block().stub_mutex.unlock();
            self.stub_held = false;
        }
    }
}

impl Drop for StubRendezvous {
    fn drop(&mut self) {
        self.release();
    }
}
