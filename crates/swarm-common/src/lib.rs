//! # Swarm Common
//!
//! Error types and small value types shared by the swarm coordination
//! primitives.
//!
//! Every other swarm crate builds on this one: the lock, the port
//! allocator and the process coordinator all report failures through
//! [`Error`] or [`ProcessError`].

pub mod errors;
pub mod types;

// Re-export commonly used items
pub use errors::{Error, ProcessError, ProcessResult, Result};
pub use types::{PortRange, MAX_PORT, PORT_COUNT, PRIVILEGED_PORT_LIMIT};
