//! Lock-protected counter in shared memory.

use crate::lock::RawLock;
use crate::shm::{Shared, ZeroInit};
use std::sync::atomic::{AtomicU64, Ordering};
use swarm_common::Result;

#[repr(C)]
#[derive(Debug)]
struct CounterCell {
    lock: RawLock,
    value: AtomicU64,
}

unsafe impl ZeroInit for CounterCell {}

/// A `u64` shared across forked processes.
///
/// Updates are short lock/modify/unlock sequences on the relaxed lock.
#[derive(Debug)]
pub struct SharedCounter {
    cell: Shared<CounterCell>,
}

impl SharedCounter {
    pub fn create() -> Result<Self> {
        Ok(Self {
            cell: Shared::new()?,
        })
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> Result<u64> {
        self.add(1)
    }

    /// Adds `n` and returns the new value.
    pub fn add(&self, n: u64) -> Result<u64> {
        let _guard = self.cell.lock.lock_relaxed()?;
        let value = self.cell.value.load(Ordering::Relaxed).saturating_add(n);
        self.cell.value.store(value, Ordering::Relaxed);
        Ok(value)
    }

    pub fn get(&self) -> u64 {
        self.cell.value.load(Ordering::Acquire)
    }
}
