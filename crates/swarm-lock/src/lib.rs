//! # Swarm Lock
//!
//! Mutual exclusion for memory shared between forked processes.
//!
//! This crate provides:
//! - [`SharedRegion`] / [`Shared`]: anonymous `MAP_SHARED` mappings that
//!   stay shared with every child forked after they are created
//! - [`RawLock`]: a futex-backed mutex that can live inside such a mapping
//! - [`LockHandle`]: a lock in its own shared mapping, with explicit
//!   create/acquire/release/destroy
//! - [`SharedCounter`]: a lock-protected `u64` for cross-process bookkeeping
//!
//! Create every shared object *before* forking workers. A process that
//! forks while holding a lock leaves the child believing the lock is held
//! too; only the process that acquired it may release it.

pub mod counter;
pub mod lock;
pub mod shm;

mod futex;

pub use counter::SharedCounter;
pub use lock::{LockGuard, LockHandle, RawLock};
pub use shm::{Shared, SharedRegion, ZeroInit};

use swarm_common::Result;

/// Allocates a new process-shared lock.
pub fn lock_create() -> Result<LockHandle> {
    LockHandle::create()
}

/// Blocks until the lock is owned by the caller.
pub fn lock_acquire(handle: &LockHandle) -> Result<()> {
    handle.acquire()
}

/// Like [`lock_acquire`], but spins with backoff before blocking.
pub fn lock_acquire_relaxed(handle: &LockHandle) -> Result<()> {
    handle.acquire_relaxed()
}

/// Releases a lock held by the caller.
pub fn lock_release(handle: &LockHandle) -> Result<()> {
    handle.release()
}

/// Unmaps the lock. Fails if the lock is still held.
pub fn lock_destroy(handle: LockHandle) -> Result<()> {
    handle.destroy()
}
