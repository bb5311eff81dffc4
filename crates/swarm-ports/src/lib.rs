//! # Swarm Ports
//!
//! Hands out network ports to concurrent worker processes without
//! collisions.
//!
//! Reservations are bits in a 65536-bit map living in shared memory and
//! guarded by a [`swarm_lock::RawLock`]. Each reservation is also checked
//! against the ports the host already has bound (see [`oracle`]), so
//! workers avoid ports other programs are using.
//!
//! Create the [`PortAllocator`] before forking workers; every child then
//! reserves from the same map.

pub mod allocator;
pub mod bitmap;
pub mod oracle;

pub use allocator::{PortAllocator, PortGrant, DEFAULT_YIELD_EVERY};
pub use bitmap::PortSet;
pub use oracle::{BoundPortOracle, FixedPorts, NoBoundPorts, ProcNetOracle};

use swarm_common::{PortRange, Result};

/// Reserves a port (`start == end`) or a contiguous block of `end - start + 1`
/// ports, validating the raw bounds first.
pub fn reserve_ports(allocator: &PortAllocator, start: i64, end: i64) -> Result<PortGrant> {
    let range = PortRange::from_raw(start, end)?;
    allocator.reserve_range(range)
}

/// Releases `start..=end`. Invalid bounds are ignored.
pub fn release_ports(allocator: &PortAllocator, start: i64, end: i64) {
    match PortRange::from_raw(start, end) {
        Ok(range) => allocator.release_range(range),
        Err(e) => tracing::debug!("Ignoring release of {}", e),
    }
}
