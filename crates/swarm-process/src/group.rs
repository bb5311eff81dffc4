//! Worker groups: fork a set of workers, tear them all down together.

use crate::reap::{Coordinator, ReapOutcome};
use crate::record::ProcessRecord;
use crate::signal::signal_pid;
use nix::sys::signal::Signal;
use nix::unistd::{fork, ForkResult, Pid};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use swarm_common::{ProcessError, ProcessResult};
use tracing::{debug, error, info, warn};

/// Exit code of a worker whose body panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// How a group is brought down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Sent first, asking workers to wind down. `None` goes straight to `hard_signal`.
    pub graceful_signal: Option<Signal>,
    /// How long workers get to exit after the graceful signal.
    pub grace_period: Duration,
    /// Sent to whatever is still alive after the grace period.
    pub hard_signal: Signal,
    /// Count workers killed by either signal in the force-killed counter.
    pub mark_forced: bool,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            graceful_signal: Some(Signal::SIGALRM),
            grace_period: Duration::from_secs(2),
            hard_signal: Signal::SIGKILL,
            mark_forced: true,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Per-outcome counts for a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub spawned: usize,
    pub not_spawned: usize,
    pub already_exited: usize,
    pub exited: usize,
    pub killed: usize,
    pub vanished: usize,
    pub unreaped: usize,
}

/// A set of forked workers owned by the parent that spawned them.
///
/// Dropping a group with live members kills and reaps them.
#[derive(Debug)]
pub struct WorkerGroup {
    name: String,
    records: Vec<ProcessRecord>,
    coordinator: Coordinator,
}

impl WorkerGroup {
    pub fn new(name: impl Into<String>, coordinator: Coordinator) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            coordinator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    /// Forks `count` workers, each running `body(index)` and exiting with
    /// its return value.
    ///
    /// A failed fork leaves a not-spawned record and does not stop the
    /// remaining spawns. Returns the number of workers started.
    ///
    /// The child never returns from this call. Only fork from a parent whose
    /// other threads hold no locks `body` needs.
    pub fn spawn<F>(&mut self, count: usize, mut body: F) -> usize
    where
        F: FnMut(usize) -> i32,
    {
        let mut started = 0;
        for _ in 0..count {
            let index = self.records.len();
            // Safety: the child runs `body` and leaves through `_exit`,
            // never returning into the caller's stack.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let code = catch_unwind(AssertUnwindSafe(|| body(index)))
                        .unwrap_or(PANIC_EXIT_CODE);
                    // Safety: skips atexit handlers and stdio flushing that
                    // belong to the parent.
                    unsafe { libc::_exit(code) }
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!("{}: worker {} started as pid {}", self.name, index, child);
                    self.records.push(ProcessRecord::running(index, child));
                    started += 1;
                }
                Err(e) => {
                    let err = ProcessError::spawn_failed(index, e.to_string());
                    warn!("{}: {}", self.name, err);
                    self.records.push(ProcessRecord::not_spawned(index, Some(err)));
                }
            }
        }
        info!("{}: {} of {} worker(s) started", self.name, started, count);
        started
    }

    /// Takes over a child spawned elsewhere (for example with
    /// `std::process::Command`).
    pub fn adopt(&mut self, pid: Pid) {
        let index = self.records.len();
        self.records.push(ProcessRecord::from_raw(index, pid));
    }

    /// Pids of members not yet reaped.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.records.iter().filter_map(|r| r.live_pid()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_live()).count()
    }

    /// Reaps members that have already exited. Never blocks.
    ///
    /// Outside a shutdown nothing is counted as force-killed.
    pub fn reap_exited(&mut self) -> usize {
        self.collect_exited(false)
    }

    fn collect_exited(&mut self, mark_forced: bool) -> usize {
        let mut reaped = 0;
        for record in self.records.iter_mut().filter(|r| r.is_live()) {
            if self.coordinator.poll_exit(record, mark_forced) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Sends `signal` to every live member without waiting.
    pub fn signal_all(&mut self, signal: Signal) -> ProcessResult<()> {
        let mut failures = Vec::new();
        let total = self.live_count();
        for record in self.records.iter_mut() {
            let Some(pid) = record.live_pid() else {
                continue;
            };
            match signal_pid(pid, signal) {
                Ok(()) => record.mark_signalled(signal.as_str()),
                Err(e) => {
                    warn!("{}: {}", self.name, e);
                    record.set_error(e.clone());
                    failures.push(e);
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::partial_failure(total, failures))
        }
    }

    /// Kills and reaps every live member with `signal`.
    pub fn kill_and_wait_all(&mut self, signal: Signal, mark_forced: bool) -> ProcessResult<()> {
        self.coordinator.reap(&mut self.records, signal, mark_forced)
    }

    /// Graceful signal, grace period, then the hard signal for stragglers.
    ///
    /// Always returns with every member reaped or reported unreapable.
    pub fn shutdown(&mut self, policy: &ShutdownPolicy) -> ProcessResult<()> {
        self.collect_exited(false);

        if let Some(graceful) = policy.graceful_signal {
            if self.live_count() > 0 {
                info!(
                    "{}: sending {} to {} worker(s)",
                    self.name,
                    graceful,
                    self.live_count()
                );
                if let Err(e) = self.signal_all(graceful) {
                    warn!("{}: graceful stop incomplete: {}", self.name, e);
                }
                let deadline = Instant::now() + policy.grace_period;
                while self.live_count() > 0 && Instant::now() < deadline {
                    std::thread::sleep(policy.poll_interval);
                    self.collect_exited(policy.mark_forced);
                }
            }
        }

        let stragglers = self.live_count();
        if stragglers > 0 {
            warn!(
                "{}: {} worker(s) still running, sending {}",
                self.name, stragglers, policy.hard_signal
            );
        }
        let result = self.kill_and_wait_all(policy.hard_signal, policy.mark_forced);
        if let Err(e) = &result {
            error!("{}: teardown incomplete: {}", self.name, e);
        }
        result
    }

    pub fn summary(&self) -> GroupSummary {
        let mut summary = GroupSummary::default();
        for record in &self.records {
            if record.pid().is_none() {
                summary.not_spawned += 1;
                continue;
            }
            summary.spawned += 1;
            match record.outcome() {
                Some(ReapOutcome::AlreadyExited) => summary.already_exited += 1,
                Some(ReapOutcome::Exited(_)) => summary.exited += 1,
                Some(ReapOutcome::Killed(_)) => summary.killed += 1,
                Some(ReapOutcome::Vanished) => summary.vanished += 1,
                Some(ReapOutcome::Skipped) | None => summary.unreaped += 1,
            }
        }
        summary
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        if self.live_count() == 0 {
            return;
        }
        warn!(
            "{}: dropped with {} live worker(s), killing",
            self.name,
            self.live_count()
        );
        if let Err(e) = self.kill_and_wait_all(Signal::SIGKILL, false) {
            error!("{}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_group() {
        let mut group = WorkerGroup::new("empty", Coordinator::default());
        assert_eq!(group.live_count(), 0);
        group.shutdown(&ShutdownPolicy::default()).unwrap();
        assert_eq!(group.summary(), GroupSummary::default());
    }

    #[test]
    fn test_adopt_non_positive_pid_is_not_spawned() {
        let mut group = WorkerGroup::new("adopt", Coordinator::default());
        group.adopt(Pid::from_raw(0));
        assert_eq!(group.live_count(), 0);
        assert_eq!(group.summary().not_spawned, 1);
    }

    #[test]
    fn test_default_shutdown_policy() {
        let policy = ShutdownPolicy::default();
        assert_eq!(policy.graceful_signal, Some(Signal::SIGALRM));
        assert_eq!(policy.hard_signal, Signal::SIGKILL);
        assert!(policy.mark_forced);
    }
}
