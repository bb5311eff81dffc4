use std::sync::atomic::{AtomicU64, Ordering};
use swarm_common::{PortRange, Result};
use swarm_lock::Shared;
use swarm_ports::PortAllocator;
use tracing::{debug, info};

use crate::config::MAX_WORKERS;

const OCCUPIED: u64 = 1 << 32;

/// One shared slot per worker recording the range it currently holds.
///
/// Lets the parent return ports a worker was killed before releasing.
#[derive(Debug)]
pub struct PortLedger {
    slots: Shared<[AtomicU64; MAX_WORKERS]>,
}

fn encode(range: PortRange) -> u64 {
    OCCUPIED | (u64::from(range.start()) << 16) | u64::from(range.end())
}

fn decode(slot: u64) -> Option<PortRange> {
    if slot & OCCUPIED == 0 {
        return None;
    }
    PortRange::new((slot >> 16) as u16, slot as u16).ok()
}

impl PortLedger {
    pub fn new() -> Result<Self> {
        Ok(Self {
            slots: Shared::new()?,
        })
    }

    /// Indices past the ledger's capacity are not tracked.
    pub fn record(&self, worker: usize, range: PortRange) {
        if let Some(slot) = self.slots.get(worker) {
            slot.store(encode(range), Ordering::SeqCst);
        }
    }

    pub fn clear(&self, worker: usize) {
        if let Some(slot) = self.slots.get(worker) {
            slot.store(0, Ordering::SeqCst);
        }
    }

    pub fn held_by(&self, worker: usize) -> Option<PortRange> {
        self.slots
            .get(worker)
            .and_then(|slot| decode(slot.load(Ordering::SeqCst)))
    }

    /// Releases every range still on the ledger. Call only once all
    /// workers are reaped. Returns the number of ranges reclaimed.
    pub fn reclaim(&self, allocator: &PortAllocator) -> usize {
        let mut reclaimed = 0;
        for (worker, slot) in self.slots.iter().enumerate() {
            if let Some(range) = decode(slot.swap(0, Ordering::SeqCst)) {
                debug!("reclaiming port(s) {} left by worker {}", range, worker);
                allocator.release_range(range);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            info!("reclaimed {} port range(s) from stopped workers", reclaimed);
        }
        reclaimed
    }
}
