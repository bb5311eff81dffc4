//! Value types shared by the port allocator and its callers.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distinct port numbers (0..=65535).
pub const PORT_COUNT: usize = 65536;

/// Highest valid port number.
pub const MAX_PORT: u16 = u16::MAX;

/// Ports below this are never handed out by a single-port reservation.
pub const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// An inclusive port range `start..=end`.
///
/// A single port is a range with `start == end`. Construction validates
/// `0 <= start <= end <= 65535`, so a `PortRange` in hand is always usable.
///
/// # Example
/// ```
/// use swarm_common::PortRange;
///
/// let range = PortRange::new(5000, 5003).unwrap();
/// assert_eq!(range.width(), 4);
/// assert!(PortRange::from_raw(-1, 10).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start > end {
            return Err(Error::invalid_range(start, end));
        }
        Ok(Self { start, end })
    }

    /// A single-port range.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Creates a range from untyped integers (config files, FFI-style callers).
    pub fn from_raw(start: i64, end: i64) -> Result<Self> {
        let max = i64::from(MAX_PORT);
        if start < 0 || end < 0 || start > max || end > max || start > end {
            return Err(Error::invalid_range(start, end));
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports covered.
    pub fn width(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_range() {
        let range = PortRange::single(8080);
        assert!(range.is_single());
        assert_eq!(range.width(), 1);
        assert_eq!(range.to_string(), "8080");
    }

    #[test]
    fn test_full_space_width() {
        let range = PortRange::new(0, MAX_PORT).unwrap();
        assert_eq!(range.width() as usize, PORT_COUNT);
        assert_eq!(range.to_string(), "0-65535");
    }

    #[test]
    fn test_rejects_inverted_range() {
        assert!(matches!(
            PortRange::new(10, 9),
            Err(Error::InvalidRange { start: 10, end: 9 })
        ));
    }

    #[test]
    fn test_from_raw_bounds() {
        assert!(PortRange::from_raw(0, 65535).is_ok());
        assert!(PortRange::from_raw(-1, 10).is_err());
        assert!(PortRange::from_raw(10, 65536).is_err());
        assert!(PortRange::from_raw(70000, 70000).is_err());
    }

    #[test]
    fn test_contains() {
        let range = PortRange::new(100, 102).unwrap();
        assert!(range.contains(100));
        assert!(range.contains(102));
        assert!(!range.contains(103));
    }
}
