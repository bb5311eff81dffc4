use std::io::ErrorKind;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;
use swarm_common::{PortRange, Result};
use swarm_ports::{PortAllocator, PortGrant};
use tracing::{debug, info, warn};

use crate::ledger::PortLedger;
use crate::signals;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// The worker could not get a resource it needs and skipped its work.
pub const EXIT_NO_RESOURCE: i32 = 3;

/// What a forked worker can see of the shared run state.
#[derive(Debug)]
pub struct WorkerContext<'a> {
    index: usize,
    range: PortRange,
    allocator: &'a PortAllocator,
    ledger: &'a PortLedger,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(
        index: usize,
        range: PortRange,
        allocator: &'a PortAllocator,
        ledger: &'a PortLedger,
    ) -> Self {
        Self {
            index,
            range,
            allocator,
            ledger,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The configured request; the grant may land higher.
    pub fn requested_range(&self) -> PortRange {
        self.range
    }

    pub fn allocator(&self) -> &PortAllocator {
        self.allocator
    }

    pub fn stop_requested(&self) -> bool {
        signals::stop_requested()
    }

    /// Reserves the configured range and notes it so the parent can
    /// reclaim it if this worker dies holding it.
    /// Reserves this worker's ports and records them on the ledger before
    /// the allocator lock is released.
    pub fn reserve_ports(&self) -> Result<PortGrant> {
        self.allocator
            .reserve_range_with(self.range, |granted| self.ledger.record(self.index, granted))
    }

    pub fn release_ports(&self, grant: &PortGrant) {
        self.allocator.release_range(grant.range());
        self.ledger.clear(self.index);
    }
}

/// Body of every worker in a run.
///
/// Runs in a forked child. The return value becomes the exit status.
pub trait Workload: Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &WorkerContext<'_>) -> i32;
}

/// Reserves ports, listens on the first one on loopback and accepts
/// connections until stopped.
#[derive(Debug, Clone)]
pub struct PortListenWorkload {
    pub accept_poll: Duration,
}

impl Default for PortListenWorkload {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_millis(10),
        }
    }
}

impl Workload for PortListenWorkload {
    fn name(&self) -> &str {
        "port-listen"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> i32 {
        let grant = match ctx.reserve_ports() {
            Ok(grant) => grant,
            Err(e) if e.is_recoverable() => {
                warn!("worker {}: skipping, {}", ctx.index(), e);
                return EXIT_NO_RESOURCE;
            }
            Err(e) => {
                warn!("worker {}: {}", ctx.index(), e);
                return EXIT_FAILURE;
            }
        };

        let code = self.listen(ctx, grant.port());
        ctx.release_ports(&grant);
        code
    }
}

impl PortListenWorkload {
    fn listen(&self, ctx: &WorkerContext<'_>, port: u16) -> i32 {
        // The host check is advisory; another program may have taken the
        // port since the scan.
        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("worker {}: cannot bind port {}: {}", ctx.index(), port, e);
                return EXIT_NO_RESOURCE;
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            warn!("worker {}: {}", ctx.index(), e);
            return EXIT_FAILURE;
        }
        debug!("worker {}: listening on 127.0.0.1:{}", ctx.index(), port);

        let mut accepted: u64 = 0;
        while !ctx.stop_requested() {
            match listener.accept() {
                Ok(_) => accepted += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(self.accept_poll)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("worker {}: accept failed: {}", ctx.index(), e);
                    return EXIT_FAILURE;
                }
            }
        }

        info!(
            "worker {}: stopping, port {} accepted {} connection(s)",
            ctx.index(),
            port,
            accepted
        );
        EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_ports::NoBoundPorts;

    #[test]
    fn test_context_reserve_records_on_ledger() {
        let allocator = PortAllocator::with_oracle(NoBoundPorts).unwrap();
        let ledger = PortLedger::new().unwrap();
        let ctx = WorkerContext::new(2, PortRange::new(44000, 44001).unwrap(), &allocator, &ledger);

        let grant = ctx.reserve_ports().unwrap();
        assert_eq!(grant.width(), 2);
        assert_eq!(ledger.held_by(2), Some(grant.range()));

        ctx.release_ports(&grant);
        assert_eq!(ledger.held_by(2), None);
        assert!(!allocator.is_reserved(grant.port()).unwrap());
    }

    #[test]
    fn test_reserved_ports_are_on_ledger_once_visible() {
        let allocator = PortAllocator::with_oracle(NoBoundPorts).unwrap();
        let ledger = PortLedger::new().unwrap();
        let range = PortRange::new(45000, 45003).unwrap();

        for index in 0..50 {
            ledger.clear(index);
            std::thread::scope(|s| {
                s.spawn(|| {
                    let ctx = WorkerContext::new(index, range, &allocator, &ledger);
                    ctx.reserve_ports().unwrap();
                });
                // Bits seen under the lock imply the ledger entry is there.
                while !allocator.is_reserved(45000).unwrap() {
                    std::hint::spin_loop();
                }
                assert_eq!(ledger.held_by(index), Some(range));
            });
            allocator.release_range(range);
            ledger.clear(index);
        }
    }

    #[test]
    fn test_listen_workload_skips_when_exhausted() {
        let allocator = PortAllocator::with_oracle(NoBoundPorts).unwrap();
        let ledger = PortLedger::new().unwrap();
        allocator.reserve(u16::MAX, u16::MAX).unwrap();
        let ctx = WorkerContext::new(0, PortRange::single(u16::MAX), &allocator, &ledger);

        let code = PortListenWorkload::default().run(&ctx);
        assert_eq!(code, EXIT_NO_RESOURCE);
        assert_eq!(ledger.held_by(0), None);
    }
}
