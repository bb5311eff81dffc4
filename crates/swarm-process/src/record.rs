//! Bookkeeping for one managed child.

use crate::reap::ReapOutcome;
use nix::unistd::Pid;
use swarm_common::ProcessError;
use swarm_process_state::{ProcessState, ProcessStateMachine};

/// One entry of a worker group.
///
/// Records for workers that never spawned carry no pid and are skipped by
/// every teardown operation.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    index: usize,
    pid: Option<Pid>,
    state: Option<ProcessStateMachine>,
    count_forced: bool,
    outcome: Option<ReapOutcome>,
    error: Option<ProcessError>,
}

impl ProcessRecord {
    /// A live child, as returned by `fork`.
    pub fn running(index: usize, pid: Pid) -> Self {
        Self {
            index,
            pid: Some(pid),
            state: Some(ProcessStateMachine::new(pid.as_raw())),
            count_forced: true,
            outcome: None,
            error: None,
        }
    }

    /// A worker slot whose spawn failed.
    pub fn not_spawned(index: usize, error: Option<ProcessError>) -> Self {
        Self {
            index,
            pid: None,
            state: None,
            count_forced: false,
            outcome: Some(ReapOutcome::Skipped),
            error,
        }
    }

    /// Builds a record from a raw pid; `<= 0` means "not spawned".
    pub fn from_raw(index: usize, pid: Pid) -> Self {
        if pid.as_raw() > 0 {
            Self::running(index, pid)
        } else {
            Self::not_spawned(index, None)
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> Option<ProcessState> {
        self.state.as_ref().map(|sm| sm.current_state())
    }

    pub fn state_machine(&self) -> Option<&ProcessStateMachine> {
        self.state.as_ref()
    }

    pub fn outcome(&self) -> Option<ReapOutcome> {
        self.outcome
    }

    /// Last failure recorded for this pid (spawn, signal or reap).
    pub fn error(&self) -> Option<&ProcessError> {
        self.error.as_ref()
    }

    /// Whether a forced kill of this record bumps the force-killed counter.
    pub fn count_forced(&self) -> bool {
        self.count_forced
    }

    pub fn set_count_forced(&mut self, count: bool) {
        self.count_forced = count;
    }

    /// Spawned and not yet reaped.
    pub fn is_live(&self) -> bool {
        self.state().is_some_and(|s| s.needs_reap())
    }

    pub(crate) fn live_pid(&self) -> Option<Pid> {
        if self.is_live() {
            self.pid
        } else {
            None
        }
    }

    pub(crate) fn signals_sent(&self) -> usize {
        self.state.as_ref().map_or(0, |sm| sm.signals_sent())
    }

    pub(crate) fn mark_signalled(&mut self, signal: &str) {
        if let Some(sm) = self.state.as_mut() {
            if let Err(e) = sm.transition_to_signal_sent(signal) {
                tracing::warn!("{}", e);
            }
        }
    }

    pub(crate) fn mark_reaped(&mut self, outcome: ReapOutcome) {
        if let Some(sm) = self.state.as_mut() {
            if let Err(e) = sm.transition_to_reaped(outcome.to_string()) {
                tracing::warn!("{}", e);
            }
        }
        self.outcome = Some(outcome);
        self.error = None;
    }

    pub(crate) fn set_error(&mut self, error: ProcessError) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_record() {
        let record = ProcessRecord::running(0, Pid::from_raw(1234));
        assert!(record.is_live());
        assert_eq!(record.state(), Some(ProcessState::Running));
        assert_eq!(record.live_pid(), Some(Pid::from_raw(1234)));
        assert!(record.count_forced());
    }

    #[test]
    fn test_non_positive_pids_are_not_spawned() {
        for raw in [0, -1] {
            let record = ProcessRecord::from_raw(2, Pid::from_raw(raw));
            assert!(!record.is_live());
            assert!(record.pid().is_none());
            assert_eq!(record.outcome(), Some(ReapOutcome::Skipped));
        }
    }

    #[test]
    fn test_reaped_record_is_not_live() {
        let mut record = ProcessRecord::running(1, Pid::from_raw(99));
        record.mark_signalled("SIGKILL");
        record.mark_reaped(ReapOutcome::Killed(nix::sys::signal::Signal::SIGKILL));
        assert!(!record.is_live());
        assert_eq!(record.state(), Some(ProcessState::Reaped));
        assert_eq!(record.signals_sent(), 1);
        assert!(record.live_pid().is_none());
    }
}
