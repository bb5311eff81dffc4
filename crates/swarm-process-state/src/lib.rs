use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use swarm_common::errors::{ProcessError, ProcessResult};

/// Transitions kept per process; older entries are dropped.
const HISTORY_LIMIT: usize = 8;

/// Lifecycle of one coordinated child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    /// Spawned and not yet signalled
    Running,
    /// A stop signal has been delivered (or the pid was already gone)
    SignalSent,
    /// Waited for; the pid no longer belongs to us
    Reaped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::SignalSent => write!(f, "signal_sent"),
            ProcessState::Reaped => write!(f, "reaped"),
        }
    }
}

impl ProcessState {
    /// Check if the process is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Reaped)
    }

    /// Check if the process still needs to be waited for
    pub fn needs_reap(&self) -> bool {
        !self.is_terminal()
    }
}

/// Represents a state transition with timestamp and optional reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: ProcessState,
    pub to_state: ProcessState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// State machine for one pid: `Running -> SignalSent -> Reaped`, with a
/// direct `Running -> Reaped` edge for children that exited on their own.
#[derive(Debug, Clone)]
pub struct ProcessStateMachine {
    pid: i32,
    current_state: ProcessState,
    state_history: Vec<StateTransition>,
    last_transition_time: DateTime<Utc>,
    signal_count: usize,
}

impl ProcessStateMachine {
    /// Create a state machine for a freshly spawned child
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            current_state: ProcessState::Running,
            state_history: Vec::new(),
            last_transition_time: Utc::now(),
            signal_count: 0,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Get the current state
    pub fn current_state(&self) -> ProcessState {
        self.current_state
    }

    /// Get the state history
    pub fn state_history(&self) -> &[StateTransition] {
        &self.state_history
    }

    /// Get the time of the last state transition
    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    /// Check if a transition from current state to target state is valid
    pub fn is_valid_transition(&self, target_state: ProcessState) -> bool {
        match (self.current_state, target_state) {
            (ProcessState::Running, ProcessState::SignalSent) => true,
            // Exited before anyone signalled it.
            (ProcessState::Running, ProcessState::Reaped) => true,
            (ProcessState::SignalSent, ProcessState::Reaped) => true,
            // Escalation re-signals a process that ignored the first signal.
            (ProcessState::SignalSent, ProcessState::SignalSent) => true,
            _ => false,
        }
    }

    /// Transition to a new state with optional reason
    pub fn transition_to(
        &mut self,
        target_state: ProcessState,
        reason: Option<String>,
    ) -> ProcessResult<()> {
        if !self.is_valid_transition(target_state) {
            return Err(ProcessError::invalid_state(
                self.pid,
                self.current_state.to_string(),
                target_state.to_string(),
            ));
        }

        let now = Utc::now();
        let from_state = self.current_state;
        self.state_history.push(StateTransition {
            from_state,
            to_state: target_state,
            timestamp: now,
            reason,
        });
        if self.state_history.len() > HISTORY_LIMIT {
            self.state_history.remove(0);
        }
        self.current_state = target_state;
        self.last_transition_time = now;
        if target_state == ProcessState::SignalSent {
            self.signal_count += 1;
        }

        tracing::debug!(
            "Process {} transitioned from {} to {}",
            self.pid,
            from_state,
            target_state
        );

        Ok(())
    }

    pub fn transition_to_signal_sent(&mut self, signal: &str) -> ProcessResult<()> {
        self.transition_to(ProcessState::SignalSent, Some(format!("sent {}", signal)))
    }

    pub fn transition_to_reaped(&mut self, reason: String) -> ProcessResult<()> {
        self.transition_to(ProcessState::Reaped, Some(reason))
    }

    /// True if the process was reaped without ever being signalled
    pub fn exited_unprompted(&self) -> bool {
        self.current_state == ProcessState::Reaped && self.signal_count == 0
    }

    /// Number of signals delivered so far
    pub fn signals_sent(&self) -> usize {
        self.signal_count
    }

    /// Get the time spent in the current state
    pub fn time_in_current_state(&self) -> chrono::Duration {
        Utc::now() - self.last_transition_time
    }

    /// Get the most recent transition
    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.state_history.last()
    }
}
