//! Error types for the swarm primitives.
//!
//! Two families:
//! - [`Error`] for lock, shared memory and port allocation failures.
//! - [`ProcessError`] for signal delivery and reaping failures.
//!
//! Transient OS conditions (`EINTR`, a process that is already gone) are
//! normalised by the callers and never show up here.

use thiserror::Error;

/// Result type alias for lock and port operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lock, shared memory and port operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The OS refused to allocate a lock or shared region.
    ///
    /// Always recoverable: the caller skips the feature that needed it.
    #[error("Resource exhausted: {resource}: {reason}")]
    ResourceExhausted { resource: String, reason: String },

    /// The caller asked for a nonsensical port range.
    #[error("Invalid port range: {start}..={end}")]
    InvalidRange { start: i64, end: i64 },

    /// No free block of the requested width exists at or above `start`.
    #[error("No ports available: {width} port(s) from {start} upward")]
    NoPortsAvailable { start: u16, width: u32 },

    /// A lock operation failed at the OS level or was misused.
    #[error("Lock error during {operation}: {reason}")]
    Lock { operation: String, reason: String },

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a ResourceExhausted error.
    pub fn resource_exhausted(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Creates an InvalidRange error.
    pub fn invalid_range(start: impl Into<i64>, end: impl Into<i64>) -> Self {
        Self::InvalidRange {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Creates a NoPortsAvailable error.
    pub fn no_ports_available(start: u16, width: u32) -> Self {
        Self::NoPortsAvailable { start, width }
    }

    /// Creates a Lock error.
    pub fn lock(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lock {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller should degrade (skip the feature) rather than fail.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted { .. } | Error::NoPortsAvailable { .. }
        )
    }
}

// ==============================================================================
// Process Coordination Errors
// ==============================================================================

/// Process-specific error types for signalling and reaping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Process not reapable: pid {pid} - {reason}")]
    NotReapable { pid: i32, reason: String },

    #[error("Signal delivery failed: pid {pid} - {signal}: {reason}")]
    SignalFailed {
        pid: i32,
        signal: String,
        reason: String,
    },

    #[error("Worker spawn failed: index {index} - {reason}")]
    SpawnFailed { index: usize, reason: String },

    #[error("Process state error: pid {pid} - cannot move from {from} to {to}")]
    InvalidState { pid: i32, from: String, to: String },

    #[error("{} of {total} process(es) could not be dispositioned", failures.len())]
    PartialFailure {
        total: usize,
        failures: Vec<ProcessError>,
    },
}

impl ProcessError {
    pub fn not_reapable(pid: i32, reason: impl Into<String>) -> Self {
        Self::NotReapable {
            pid,
            reason: reason.into(),
        }
    }

    pub fn signal_failed(pid: i32, signal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            pid,
            signal: signal.into(),
            reason: reason.into(),
        }
    }

    pub fn spawn_failed(index: usize, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            index,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(pid: i32, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidState {
            pid,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn partial_failure(total: usize, failures: Vec<ProcessError>) -> Self {
        Self::PartialFailure { total, failures }
    }

    /// Pid the error refers to, if it refers to exactly one.
    pub fn pid(&self) -> Option<i32> {
        match self {
            Self::NotReapable { pid, .. }
            | Self::SignalFailed { pid, .. }
            | Self::InvalidState { pid, .. } => Some(*pid),
            Self::SpawnFailed { .. } | Self::PartialFailure { .. } => None,
        }
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::invalid_range(10, 5);
        assert!(matches!(err, Error::InvalidRange { start: 10, end: 5 }));
        assert_eq!(err.to_string(), "Invalid port range: 10..=5");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::resource_exhausted("lock", "ENOMEM").is_recoverable());
        assert!(Error::no_ports_available(5000, 1).is_recoverable());
        assert!(!Error::invalid_range(-1, 5).is_recoverable());
        assert!(!Error::lock("release", "not held").is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_process_error_construction() {
        let error = ProcessError::not_reapable(42, "not a child");
        assert_eq!(error.pid(), Some(42));
        assert_eq!(
            format!("{}", error),
            "Process not reapable: pid 42 - not a child"
        );

        let error = ProcessError::spawn_failed(3, "EAGAIN");
        assert!(error.pid().is_none());
        assert!(format!("{}", error).contains("spawn failed"));
    }

    #[test]
    fn test_partial_failure_message() {
        let error = ProcessError::partial_failure(
            4,
            vec![
                ProcessError::not_reapable(10, "EPERM"),
                ProcessError::not_reapable(11, "EPERM"),
            ],
        );
        assert_eq!(
            error.to_string(),
            "2 of 4 process(es) could not be dispositioned"
        );
    }
}
