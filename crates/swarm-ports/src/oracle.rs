//! Host-level view of ports that are already bound.
//!
//! The snapshot is advisory: it is read without any lock and may be stale
//! by the time it is used. The shared bitmap stays the only authority on
//! overlap between this program's own workers.

use crate::bitmap::PortSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Kernel connection tables read by default.
pub const DEFAULT_PROC_NET_TABLES: &[&str] = &[
    "/proc/net/tcp",
    "/proc/net/tcp6",
    "/proc/net/udp",
    "/proc/net/udp6",
];

/// Local addresses whose ports count as bound: wildcard and loopback, for
/// IPv4 and IPv6, in both byte orders the kernel may print.
const INTERESTING_ADDRESSES: &[&str] = &[
    "00000000",
    "0100007F",
    "7F000001",
    "00000000000000000000000000000000",
    "00000000000000000000000001000000",
    "00000000000000000000000000000001",
];

/// Source of the "currently bound" snapshot consulted by reservations.
pub trait BoundPortOracle: Send + Sync + fmt::Debug {
    /// Ports the host currently has bound on loopback or wildcard addresses.
    fn bound_ports(&self) -> PortSet;
}

/// Reads `/proc/net/{tcp,udp}{,6}`-style tables.
#[derive(Debug, Clone)]
pub struct ProcNetOracle {
    tables: Vec<PathBuf>,
}

impl ProcNetOracle {
    pub fn new(tables: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tables(&self) -> &[PathBuf] {
        &self.tables
    }
}

impl Default for ProcNetOracle {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_NET_TABLES.iter().copied())
    }
}

impl BoundPortOracle for ProcNetOracle {
    fn bound_ports(&self) -> PortSet {
        let mut ports = PortSet::new();
        for table in &self.tables {
            match std::fs::read_to_string(table) {
                Ok(content) => {
                    let found = parse_proc_net_table(&content, &mut ports);
                    debug!("{}: {} bound port entries", table.display(), found);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} not present, skipping", table.display());
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", table.display(), e);
                }
            }
        }
        ports
    }
}

/// Assumes nothing is bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBoundPorts;

impl BoundPortOracle for NoBoundPorts {
    fn bound_ports(&self) -> PortSet {
        PortSet::new()
    }
}

/// A fixed list of bound ports.
#[derive(Debug, Clone, Default)]
pub struct FixedPorts(pub Vec<u16>);

impl BoundPortOracle for FixedPorts {
    fn bound_ports(&self) -> PortSet {
        self.0.iter().copied().collect()
    }
}

/// Adds the local port of every loopback/wildcard entry in one table.
///
/// Lines look like `  0: 0100007F:1F90 00000000:0000 0A ...`; the header
/// and anything malformed are skipped. Returns the number of entries added.
pub fn parse_proc_net_table(content: &str, ports: &mut PortSet) -> usize {
    let mut added = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let index = match fields.next() {
            Some(f) if f.ends_with(':') => f,
            _ => continue,
        };
        if !index[..index.len() - 1].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some((address, port)) = fields.next().and_then(|local| local.split_once(':')) else {
            continue;
        };
        if !INTERESTING_ADDRESSES
            .iter()
            .any(|a| a.eq_ignore_ascii_case(address))
        {
            continue;
        }
        if let Ok(port) = u16::from_str_radix(port, 16) {
            ports.insert(port);
            added += 1;
        }
    }
    added
}
