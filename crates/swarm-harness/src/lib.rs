//! # Swarm Harness
//!
//! Runs a swarm of forked workers that each hold a port reservation,
//! then tears the swarm down without leaking processes or ports.
//!
//! - [`config`]: YAML configuration with validation
//! - [`Harness`]: shared state created before fork, the run loop and
//!   the teardown report
//! - [`Workload`]: what each worker does; [`PortListenWorkload`] is the
//!   stock one
//! - [`signals`]: stop flag driven by the graceful signal and Ctrl-C

pub mod config;
pub mod harness;
pub mod ledger;
pub mod signals;
pub mod workload;

pub use config::HarnessConfig;
pub use harness::{Harness, RunSummary};
pub use ledger::PortLedger;
pub use workload::{
    PortListenWorkload, WorkerContext, Workload, EXIT_FAILURE, EXIT_NO_RESOURCE, EXIT_SUCCESS,
};
