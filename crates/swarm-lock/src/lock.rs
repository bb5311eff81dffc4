//! Process-shared mutex.
//!
//! [`RawLock`] is a single `u32` word with three states:
//! `0` unlocked, `1` locked, `2` locked with (possible) sleepers.
//! Because it is plain memory plus shared futex calls, it works from any
//! process that maps the page holding it.

use crate::futex;
use crate::shm::{Shared, ZeroInit};
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use swarm_common::{Error, Result};
use tracing::warn;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Spin rounds with exponential backoff before yielding.
const SPIN_LIMIT: u32 = 6;
/// Backoff rounds (spinning then yielding) before `acquire_relaxed` blocks.
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for short critical sections.
#[derive(Debug, Default)]
struct Backoff {
    step: u32,
}

impl Backoff {
    fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }
        self.step += 1;
    }

    fn is_completed(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}

/// A mutex word meant to live in `MAP_SHARED` memory.
///
/// Zeroed memory is an unlocked `RawLock`, so it can be embedded in any
/// [`ZeroInit`] struct without further initialisation.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawLock {
    state: AtomicU32,
}

unsafe impl ZeroInit for RawLock {}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Takes the lock if it is free, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocks in the kernel until the lock is ours.
    pub fn acquire(&self) -> Result<()> {
        if self.try_acquire() {
            return Ok(());
        }
        self.acquire_contended()
    }

    /// Spins with exponential backoff first, then falls back to blocking.
    ///
    /// Meant for critical sections of a few instructions, where a trip
    /// through the kernel costs more than the wait itself.
    pub fn acquire_relaxed(&self) -> Result<()> {
        let mut backoff = Backoff::default();
        loop {
            if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_acquire() {
                return Ok(());
            }
            if backoff.is_completed() {
                return self.acquire_contended();
            }
            backoff.snooze();
        }
    }

    fn acquire_contended(&self) -> Result<()> {
        loop {
            // Advertise a sleeper; if the word was free we now own it.
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(());
            }
            futex::wait(&self.state, CONTENDED)?;
        }
    }

    /// Releases the lock, waking one sleeper if there may be any.
    ///
    /// Releasing a lock that is not held is reported as an error.
    pub fn release(&self) -> Result<()> {
        match self.state.swap(UNLOCKED, Ordering::Release) {
            UNLOCKED => Err(Error::lock("release", "lock is not held")),
            CONTENDED => futex::wake_one(&self.state),
            _ => Ok(()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.acquire()?;
        Ok(LockGuard {
            lock: self,
            held: true,
        })
    }

    /// [`RawLock::lock`] using the spinning acquire.
    pub fn lock_relaxed(&self) -> Result<LockGuard<'_>> {
        self.acquire_relaxed()?;
        Ok(LockGuard {
            lock: self,
            held: true,
        })
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a RawLock,
    held: bool,
}

impl LockGuard<'_> {
    /// Releases the lock, yields the processor, and takes it back.
    ///
    /// Long scans call this periodically so other processes get a turn.
    pub fn bump(&mut self) -> Result<()> {
        self.bump_with(|| {})
    }

    /// [`LockGuard::bump`], running `unlocked` while the lock is free.
    pub fn bump_with<F: FnOnce()>(&mut self, unlocked: F) -> Result<()> {
        self.held = false;
        self.lock.release()?;
        unlocked();
        std::thread::yield_now();
        self.lock.acquire_relaxed()?;
        self.held = true;
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = self.lock.release() {
            warn!("Failed to release shared lock: {}", e);
        }
    }
}

/// A [`RawLock`] in its own shared mapping.
///
/// Create it before forking; every child then shares the same lock.
#[derive(Debug)]
pub struct LockHandle {
    shared: Shared<RawLock>,
}

impl LockHandle {
    /// Maps and initialises a new lock.
    pub fn create() -> Result<Self> {
        let shared = Shared::<RawLock>::new()?;
        Ok(Self { shared })
    }

    /// Unmaps the lock. Refuses while the lock is held.
    pub fn destroy(self) -> Result<()> {
        if self.shared.is_locked() {
            return Err(Error::lock("destroy", "lock is still held"));
        }
        self.shared.unmap()
    }
}

impl Deref for LockHandle {
    type Target = RawLock;

    fn deref(&self) -> &RawLock {
        &self.shared
    }
}
