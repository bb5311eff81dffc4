//! The port allocator.
//!
//! A reservation scans upward from the requested start port (never
//! wrapping) for the first block of free ports, where "free" means clear
//! in the shared bitmap *and* absent from the host's bound-port snapshot.
//!
//! The scan runs under the bitmap lock but gives it up every
//! `yield_every` probes (release, yield, reacquire), so the time any one
//! process holds the lock does not grow with the length of the scan.

use crate::bitmap::PortBitmap;
use crate::oracle::{BoundPortOracle, ProcNetOracle};
use swarm_common::{Error, PortRange, Result, MAX_PORT, PRIVILEGED_PORT_LIMIT};
use swarm_lock::Shared;
use tracing::{debug, info, trace, warn};

/// Probes between lock release/yield/reacquire steps during a scan.
pub const DEFAULT_YIELD_EVERY: usize = 16;

/// The outcome of a successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortGrant {
    requested: u16,
    range: PortRange,
}

impl PortGrant {
    /// First granted port.
    pub fn port(&self) -> u16 {
        self.range.start()
    }

    /// The start port the caller asked for.
    pub fn requested(&self) -> u16 {
        self.requested
    }

    pub fn width(&self) -> u32 {
        self.range.width()
    }

    /// The granted ports, for handing back to [`PortAllocator::release_range`].
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// True when the grant does not start where the caller asked.
    ///
    /// Informational only: the caller still owns a valid reservation.
    pub fn was_relocated(&self) -> bool {
        self.range.start() != self.requested
    }
}

/// Reserves ports from a bitmap shared by every process forked after
/// construction.
#[derive(Debug)]
pub struct PortAllocator {
    bitmap: Shared<PortBitmap>,
    oracle: Box<dyn BoundPortOracle>,
    yield_every: usize,
    #[cfg(test)]
    yield_hook: Option<YieldHook>,
}

/// Runs while a scan has the lock given up.
#[cfg(test)]
struct YieldHook(Box<dyn Fn(&PortBitmap, u16) + Send + Sync>);

#[cfg(test)]
impl std::fmt::Debug for YieldHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("YieldHook")
    }
}

impl PortAllocator {
    /// Creates an allocator that checks the host's `/proc/net` tables.
    ///
    /// Fails with `ResourceExhausted` if the shared bitmap cannot be mapped.
    pub fn new() -> Result<Self> {
        Self::with_oracle(ProcNetOracle::default())
    }

    /// Creates an allocator with a custom source of bound ports.
    pub fn with_oracle(oracle: impl BoundPortOracle + 'static) -> Result<Self> {
        let bitmap = Shared::<PortBitmap>::new()?;
        Ok(Self {
            bitmap,
            oracle: Box::new(oracle),
            yield_every: DEFAULT_YIELD_EVERY,
            #[cfg(test)]
            yield_hook: None,
        })
    }

    /// Overrides the number of probes between yields (minimum 1).
    pub fn with_yield_every(mut self, probes: usize) -> Self {
        self.yield_every = probes.max(1);
        self
    }

    pub fn yield_every(&self) -> usize {
        self.yield_every
    }

    /// Reserves one port (`start == end`) or `end - start + 1` contiguous ports.
    pub fn reserve(&self, start: u16, end: u16) -> Result<PortGrant> {
        self.reserve_range(PortRange::new(start, end)?)
    }

    #[cfg(test)]
    fn with_yield_hook(mut self, hook: impl Fn(&PortBitmap, u16) + Send + Sync + 'static) -> Self {
        self.yield_hook = Some(YieldHook(Box::new(hook)));
        self
    }

    #[cfg(test)]
    fn while_yielding(&self, candidate: u16) {
        if let Some(hook) = &self.yield_hook {
            (hook.0)(&*self.bitmap, candidate);
        }
    }

    #[cfg(not(test))]
    fn while_yielding(&self, _candidate: u16) {}

    /// Reserves the ports described by `range`.
    ///
    /// Single ports below 1024 are shifted up by 1024 before scanning.
    pub fn reserve_range(&self, range: PortRange) -> Result<PortGrant> {
        self.reserve_range_with(range, |_| {})
    }

    /// [`PortAllocator::reserve_range`], handing the granted range to
    /// `commit` before the bitmap lock is released.
    ///
    /// A caller that records its grant in `commit` cannot be killed between
    /// owning the bits and having recorded them, short of dying with the
    /// lock held.
    pub fn reserve_range_with<F>(&self, range: PortRange, commit: F) -> Result<PortGrant>
    where
        F: FnOnce(PortRange),
    {
        let requested = range.start();
        let width = range.width();
        let start = if range.is_single() && requested < PRIVILEGED_PORT_LIMIT {
            requested + PRIVILEGED_PORT_LIMIT
        } else {
            requested
        };

        // Advisory and unsynchronised: read before taking the lock.
        let bound = self.oracle.bound_ports();

        let mut locked = self.bitmap.lock()?;
        let mut run: u32 = 0;
        let mut probes: usize = 0;

        for candidate in start..=MAX_PORT {
            probes += 1;
            if probes % self.yield_every == 0 {
                locked.bump_with(|| self.while_yielding(candidate))?;
                trace!("port scan yielded at {} after {} probes", candidate, probes);
            }

            if locked.is_set(candidate) || bound.contains(candidate) {
                run = 0;
                continue;
            }
            run += 1;
            if run < width {
                continue;
            }

            let first = candidate - (width - 1) as u16;
            // Bits probed before the last yield may have been taken since.
            if let Some(taken) = (first..candidate).rev().find(|p| locked.is_set(*p)) {
                run = u32::from(candidate - taken);
                continue;
            }

            let granted = PortRange::new(first, candidate)?;
            for port in first..=candidate {
                locked.set(port);
            }
            commit(granted);
            drop(locked);

            let grant = PortGrant {
                requested,
                range: granted,
            };
            if grant.was_relocated() {
                info!(
                    "port {} requested, reserved {} instead ({} port(s))",
                    requested, first, width
                );
            } else {
                debug!("reserved port {} ({} port(s))", first, width);
            }
            return Ok(grant);
        }

        Err(Error::no_ports_available(start, width))
    }

    /// Releases `start..=end`. Never fails; inverted bounds are ignored.
    pub fn release(&self, start: u16, end: u16) {
        match PortRange::new(start, end) {
            Ok(range) => self.release_range(range),
            Err(e) => debug!("Ignoring release of {}", e),
        }
    }

    /// Clears every bit in `range`. Releasing free ports is harmless.
    pub fn release_range(&self, range: PortRange) {
        let locked = match self.bitmap.lock() {
            Ok(locked) => locked,
            Err(e) => {
                warn!("Failed to lock port bitmap to release {}: {}", range, e);
                return;
            }
        };
        for port in range.start()..=range.end() {
            locked.clear(port);
        }
        debug!("released port(s) {}", range);
    }

    /// Whether `port` is currently reserved through this allocator.
    pub fn is_reserved(&self, port: u16) -> Result<bool> {
        Ok(self.bitmap.lock()?.is_set(port))
    }

    /// Number of ports currently reserved.
    pub fn reserved_count(&self) -> Result<usize> {
        Ok(self.bitmap.lock()?.count())
    }

    /// Whether some process holds the bitmap lock right now.
    ///
    /// Once every worker has been reaped, a held lock belonged to a worker
    /// killed inside its critical section and will never be released.
    pub fn is_locked(&self) -> bool {
        self.bitmap.is_locked()
    }

    /// Unmaps the bitmap.
    pub fn destroy(self) -> Result<()> {
        self.bitmap.unmap()
    }
}
