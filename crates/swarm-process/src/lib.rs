//! # Swarm Process
//!
//! Tears down child processes without leaving zombies or hanging.
//!
//! This crate provides:
//! - [`signal_pid`]: signal delivery that treats "already gone" as success
//! - [`Coordinator`]: kill-and-wait for one pid or a batch, with escalation
//!   to `SIGKILL`, `EINTR` handling and partial-failure accumulation
//! - [`WorkerGroup`]: forks a group of workers and shuts them down,
//!   graceful signal first, hard signal for whatever is left
//!
//! Every managed pid moves through `Running -> SignalSent -> Reaped`
//! (see [`swarm_process_state`]).

pub mod group;
pub mod reap;
pub mod record;
pub mod signal;

pub use group::{GroupSummary, ShutdownPolicy, WorkerGroup};
pub use reap::{
    begin_teardown, end_teardown, teardown_in_progress, Coordinator, ReapOutcome, ReapPolicy,
};
pub use record::ProcessRecord;
pub use signal::{process_exists, signal_pid};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

use std::sync::Arc;
use swarm_common::ProcessResult;
use swarm_lock::SharedCounter;

/// Sends `signal` to `pid` and reaps it with the default policy.
///
/// Passing `forced_kills` marks the kill as forced: a pid that ends up
/// killed by a signal bumps that counter.
pub fn kill_and_wait(
    pid: Pid,
    signal: Signal,
    forced_kills: Option<Arc<SharedCounter>>,
) -> ProcessResult<ReapOutcome> {
    let (coordinator, mark_forced) = default_coordinator(forced_kills);
    coordinator.kill_and_wait(pid, signal, mark_forced)
}

/// Batch form of [`kill_and_wait`]: signals every pid, then reaps every pid.
pub fn kill_and_wait_many(
    pids: &[Pid],
    signal: Signal,
    forced_kills: Option<Arc<SharedCounter>>,
) -> ProcessResult<Vec<ReapOutcome>> {
    let (coordinator, mark_forced) = default_coordinator(forced_kills);
    coordinator.kill_and_wait_many(pids, signal, mark_forced)
}

fn default_coordinator(forced_kills: Option<Arc<SharedCounter>>) -> (Coordinator, bool) {
    match forced_kills {
        Some(counter) => (Coordinator::default().with_forced_kill_counter(counter), true),
        None => (Coordinator::default(), false),
    }
}
