//! Port bit sets.
//!
//! [`PortBitmap`] is the shared, lock-guarded reservation map. Its bits are
//! only reachable through [`LockedBitmap`], which exists only while the
//! bitmap's lock is held. [`PortSet`] is a private, unsynchronised set used
//! for host snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use swarm_common::{Result, PORT_COUNT};
use swarm_lock::{LockGuard, RawLock, ZeroInit};

const WORDS: usize = PORT_COUNT / 64;

#[inline]
fn split(port: u16) -> (usize, u64) {
    (usize::from(port) / 64, 1u64 << (port % 64))
}

/// One bit per port, plus the lock that guards them.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct PortBitmap {
    lock: RawLock,
    words: [AtomicU64; WORDS],
}

unsafe impl ZeroInit for PortBitmap {}

impl PortBitmap {
    /// Takes the bitmap lock (spinning first; hold times are short).
    pub(crate) fn lock(&self) -> Result<LockedBitmap<'_>> {
        let guard = self.lock.lock_relaxed()?;
        Ok(LockedBitmap {
            guard,
            words: &self.words,
        })
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Access to the bits while the lock is held.
#[derive(Debug)]
pub(crate) struct LockedBitmap<'a> {
    guard: LockGuard<'a>,
    words: &'a [AtomicU64; WORDS],
}

impl LockedBitmap<'_> {
    pub(crate) fn is_set(&self, port: u16) -> bool {
        let (word, mask) = split(port);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }

    pub(crate) fn set(&self, port: u16) {
        let (word, mask) = split(port);
        self.words[word].fetch_or(mask, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self, port: u16) {
        let (word, mask) = split(port);
        self.words[word].fetch_and(!mask, Ordering::Relaxed);
    }

    pub(crate) fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Lets other processes in: release, run `unlocked`, yield, reacquire.
    pub(crate) fn bump_with<F: FnOnce()>(&mut self, unlocked: F) -> Result<()> {
        self.guard.bump_with(unlocked)
    }
}

/// A plain set of ports.
#[derive(Clone, PartialEq, Eq)]
pub struct PortSet {
    words: Vec<u64>,
}

impl PortSet {
    pub fn new() -> Self {
        Self {
            words: vec![0; WORDS],
        }
    }

    pub fn insert(&mut self, port: u16) {
        let (word, mask) = split(port);
        self.words[word] |= mask;
    }

    pub fn contains(&self, port: u16) -> bool {
        let (word, mask) = split(port);
        self.words[word] & mask != 0
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..=u16::MAX).filter(move |p| self.contains(*p))
    }
}

impl Default for PortSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<u16> for PortSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = PortSet::new();
        for port in iter {
            set.insert(port);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_lock::Shared;

    #[test]
    fn test_port_set_edges() {
        let set: PortSet = [0u16, 63, 64, 65535].into_iter().collect();
        assert_eq!(set.len(), 4);
        assert!(set.contains(0));
        assert!(set.contains(65535));
        assert!(!set.contains(1));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 65535]);
    }

    #[test]
    fn test_empty_port_set() {
        let set = PortSet::default();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_locked_bitmap_set_clear() {
        let bitmap = Shared::<PortBitmap>::new().unwrap();
        let locked = bitmap.lock().unwrap();
        assert_eq!(locked.count(), 0);
        locked.set(65535);
        locked.set(1);
        assert!(locked.is_set(65535));
        assert!(locked.is_set(1));
        assert!(!locked.is_set(2));
        locked.clear(1);
        locked.clear(1);
        assert_eq!(locked.count(), 1);
    }

    #[test]
    fn test_lock_is_released_with_view() {
        let bitmap = Shared::<PortBitmap>::new().unwrap();
        {
            let mut locked = bitmap.lock().unwrap();
            locked.bump_with(|| {}).unwrap();
            assert!(bitmap.lock.is_locked());
        }
        assert!(!bitmap.lock.is_locked());
    }
}
