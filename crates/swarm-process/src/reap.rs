//! Kill-and-wait, for one pid or many.
//!
//! A reap always ends with the pid either waited for or confirmed gone.
//! Interrupted waits are retried; a child that ignores a soft signal is
//! escalated to `SIGKILL` once [`ReapPolicy::escalate_after`] elapses; a
//! pid that is not our child is polled for a bounded time instead of
//! waited on.

use crate::record::ProcessRecord;
use crate::signal::{process_exists, signal_pid};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarm_common::{ProcessError, ProcessResult};
use swarm_lock::SharedCounter;
use tracing::{debug, error, info, warn};

static TEARDOWN: AtomicBool = AtomicBool::new(false);

/// Marks process-group teardown as in progress.
///
/// From then on an interrupted `wait` is treated as permanent once
/// [`ReapPolicy::max_interrupts`] is exceeded. Safe to call from a signal
/// handler.
pub fn begin_teardown() {
    TEARDOWN.store(true, Ordering::SeqCst);
}

/// Clears the teardown flag.
pub fn end_teardown() {
    TEARDOWN.store(false, Ordering::SeqCst);
}

pub fn teardown_in_progress() -> bool {
    TEARDOWN.load(Ordering::SeqCst)
}

/// How one pid was dispositioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReapOutcome {
    /// Not a spawned process (pid `<= 0` or our own pid); nothing done.
    Skipped,
    /// Had already exited before any signal was sent.
    AlreadyExited,
    /// Exited with this code after being signalled.
    Exited(i32),
    /// Terminated by this signal.
    #[serde(serialize_with = "serialize_signal")]
    Killed(Signal),
    /// Not our child; confirmed no longer running.
    Vanished,
}

fn serialize_signal<S: serde::Serializer>(signal: &Signal, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(signal.as_str())
}

impl ReapOutcome {
    /// Terminated by a signal rather than exiting by itself.
    pub fn was_forced(&self) -> bool {
        matches!(self, ReapOutcome::Killed(_))
    }
}

impl fmt::Display for ReapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapOutcome::Skipped => write!(f, "skipped"),
            ReapOutcome::AlreadyExited => write!(f, "already exited"),
            ReapOutcome::Exited(code) => write!(f, "exited with {}", code),
            ReapOutcome::Killed(signal) => write!(f, "killed by {}", signal.as_str()),
            ReapOutcome::Vanished => write!(f, "vanished"),
        }
    }
}

/// Timing knobs for reaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapPolicy {
    /// How long a child may ignore a non-`SIGKILL` signal before it gets `SIGKILL`.
    pub escalate_after: Duration,
    /// Polling interval while waiting out `escalate_after` or a foreign pid.
    pub poll_interval: Duration,
    /// Interrupted waits tolerated once teardown is in progress.
    pub max_interrupts: u32,
    /// How long to watch a pid that is not our child before giving up.
    pub foreign_wait: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            escalate_after: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_interrupts: 3,
            foreign_wait: Duration::from_millis(500),
        }
    }
}

fn outcome_from_status(status: WaitStatus, signalled: bool) -> Option<ReapOutcome> {
    match status {
        WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) if !signalled => {
            Some(ReapOutcome::AlreadyExited)
        }
        WaitStatus::Exited(_, code) => Some(ReapOutcome::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ReapOutcome::Killed(signal)),
        _ => None,
    }
}

/// Where exit statuses come from. [`SystemWait`] calls `waitpid`.
pub trait WaitSource: Send + Sync + fmt::Debug {
    fn wait(&self, pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<WaitStatus>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWait;

impl WaitSource for SystemWait {
    fn wait(&self, pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
        waitpid(pid, options)
    }
}

/// Result of one non-blocking look at a record.
enum Progress {
    Reaped,
    Running,
    NotOurs,
}

/// Drives records from `Running` to `Reaped`.
///
/// A pid counts as force-killed when it is reaped as [`ReapOutcome::Killed`]
/// during a kill request made with `mark_forced`, whatever the signal was.
#[derive(Debug, Clone)]
pub struct Coordinator {
    policy: ReapPolicy,
    forced_kills: Option<Arc<SharedCounter>>,
    waiter: Arc<dyn WaitSource>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(ReapPolicy::default())
    }
}

impl Coordinator {
    pub fn new(policy: ReapPolicy) -> Self {
        Self {
            policy,
            forced_kills: None,
            waiter: Arc::new(SystemWait),
        }
    }

    /// Counts forced kills in `counter` (shared with forked workers).
    pub fn with_forced_kill_counter(mut self, counter: Arc<SharedCounter>) -> Self {
        self.forced_kills = Some(counter);
        self
    }

    /// Replaces `waitpid` as the source of exit statuses.
    pub fn with_wait_source(mut self, waiter: impl WaitSource + 'static) -> Self {
        self.waiter = Arc::new(waiter);
        self
    }

    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    /// Forced kills recorded so far, if a counter is attached.
    pub fn forced_kills(&self) -> Option<u64> {
        self.forced_kills.as_ref().map(|c| c.get())
    }

    /// Sends `signal`; a vanished pid is not an error.
    pub fn signal(&self, pid: Pid, signal: Signal) -> ProcessResult<()> {
        signal_pid(pid, signal)
    }

    /// Sends `signal` to `pid` and waits until it is reaped or confirmed gone.
    ///
    /// With `mark_forced`, a kill by signal bumps the force-killed counter.
    pub fn kill_and_wait(
        &self,
        pid: Pid,
        signal: Signal,
        mark_forced: bool,
    ) -> ProcessResult<ReapOutcome> {
        if pid == Pid::this() {
            return Ok(ReapOutcome::Skipped);
        }
        let mut records = [ProcessRecord::from_raw(0, pid)];
        self.reap(&mut records, signal, mark_forced)?;
        Ok(records[0].outcome().unwrap_or(ReapOutcome::Skipped))
    }

    /// [`Coordinator::kill_and_wait`] over a batch.
    ///
    /// Every live pid is signalled before the first blocking wait. All pids
    /// are dispositioned even when some fail; failures come back together
    /// as one `PartialFailure`. Pids `<= 0` are skipped.
    pub fn kill_and_wait_many(
        &self,
        pids: &[Pid],
        signal: Signal,
        mark_forced: bool,
    ) -> ProcessResult<Vec<ReapOutcome>> {
        let this = Pid::this();
        let mut records: Vec<ProcessRecord> = pids
            .iter()
            .enumerate()
            .map(|(i, pid)| {
                if *pid == this {
                    ProcessRecord::not_spawned(i, None)
                } else {
                    ProcessRecord::from_raw(i, *pid)
                }
            })
            .collect();
        self.reap(&mut records, signal, mark_forced)?;
        Ok(records
            .iter()
            .map(|r| r.outcome().unwrap_or(ReapOutcome::Skipped))
            .collect())
    }

    /// Signals and reaps every live record.
    ///
    /// With a signal other than `SIGKILL`, all records share one
    /// `escalate_after` window that starts once every signal is out; the
    /// stragglers then get `SIGKILL` together before any blocking wait.
    pub fn reap(
        &self,
        records: &mut [ProcessRecord],
        signal: Signal,
        mark_forced: bool,
    ) -> ProcessResult<()> {
        let total = records.iter().filter(|r| r.is_live()).count();
        let mut failures = Vec::new();

        // Deliver every signal before blocking on any single pid.
        for record in records.iter_mut() {
            let Some(pid) = record.live_pid() else {
                continue;
            };
            if self.poll_exit(record, mark_forced) {
                continue;
            }
            match signal_pid(pid, signal) {
                Ok(()) => record.mark_signalled(signal.as_str()),
                Err(e) => {
                    warn!("{}", e);
                    record.set_error(e);
                }
            }
        }

        let mut pending: Vec<usize> = (0..records.len())
            .filter(|&i| records[i].is_live())
            .collect();
        let mut foreign = Vec::new();

        if signal != Signal::SIGKILL && !pending.is_empty() {
            let deadline = Instant::now() + self.policy.escalate_after;
            loop {
                pending.retain(|&i| {
                    self.sort_progress(&mut records[i], mark_forced, &mut foreign, &mut failures, i)
                });
                if pending.is_empty() || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(self.policy.poll_interval);
            }

            if !pending.is_empty() {
                info!(
                    "{} process(es) ignored {} for {:?}, escalating to SIGKILL",
                    pending.len(),
                    signal,
                    self.policy.escalate_after
                );
                pending.retain(|&i| match self.escalate(&mut records[i]) {
                    Ok(()) => true,
                    Err(e) => {
                        fail(&mut records[i], e, &mut failures);
                        false
                    }
                });
            }
        }

        for i in pending {
            let record = &mut records[i];
            let Some(pid) = record.live_pid() else {
                continue;
            };
            match self.wait_blocking(record, pid, signal) {
                Ok(Some(outcome)) => self.finish(record, outcome, mark_forced),
                Ok(None) => foreign.push(i),
                Err(e) => fail(record, e, &mut failures),
            }
        }

        if !foreign.is_empty() {
            self.await_foreign(records, foreign, &mut failures);
        }

        match failures.len() {
            0 => Ok(()),
            1 if total == 1 => Err(failures.remove(0)),
            _ => Err(ProcessError::partial_failure(total, failures)),
        }
    }

    /// Reaps `record` if it has already exited. Never blocks.
    pub(crate) fn poll_exit(&self, record: &mut ProcessRecord, mark_forced: bool) -> bool {
        // Not ours, interrupted or failed: the blocking phase sorts it out.
        matches!(self.poll_once(record, mark_forced), Ok(Progress::Reaped))
    }

    fn poll_once(&self, record: &mut ProcessRecord, mark_forced: bool) -> ProcessResult<Progress> {
        let Some(pid) = record.live_pid() else {
            return Ok(Progress::Reaped);
        };
        match self.waiter.wait(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(Progress::Running),
            Ok(status) => match outcome_from_status(status, record.signals_sent() > 0) {
                Some(outcome) => {
                    self.finish(record, outcome, mark_forced);
                    Ok(Progress::Reaped)
                }
                None => Ok(Progress::Running),
            },
            Err(Errno::ECHILD) => Ok(Progress::NotOurs),
            Err(e) => Err(ProcessError::not_reapable(pid.as_raw(), e.to_string())),
        }
    }

    /// One polling round for record `i`; true while it is still running.
    fn sort_progress(
        &self,
        record: &mut ProcessRecord,
        mark_forced: bool,
        foreign: &mut Vec<usize>,
        failures: &mut Vec<ProcessError>,
        i: usize,
    ) -> bool {
        match self.poll_once(record, mark_forced) {
            Ok(Progress::Running) => true,
            Ok(Progress::Reaped) => false,
            Ok(Progress::NotOurs) => {
                foreign.push(i);
                false
            }
            Err(e) => {
                fail(record, e, failures);
                false
            }
        }
    }

    /// Blocks until `record` is reaped. `None` means it is not our child.
    fn wait_blocking(
        &self,
        record: &mut ProcessRecord,
        pid: Pid,
        signal: Signal,
    ) -> ProcessResult<Option<ReapOutcome>> {
        let mut interrupts = 0u32;
        loop {
            match self.waiter.wait(pid, None) {
                Ok(status) => {
                    if let Some(outcome) = outcome_from_status(status, record.signals_sent() > 0) {
                        return Ok(Some(outcome));
                    }
                }
                Err(Errno::EINTR) => {
                    if !teardown_in_progress() {
                        continue;
                    }
                    interrupts += 1;
                    if interrupts > self.policy.max_interrupts {
                        return Err(ProcessError::not_reapable(
                            pid.as_raw(),
                            format!("wait interrupted {} times during teardown", interrupts),
                        ));
                    }
                    // Teardown: make sure the next wait has something to collect.
                    if record.signals_sent() == 0 || signal != Signal::SIGKILL {
                        self.escalate(record)?;
                    }
                }
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(ProcessError::not_reapable(pid.as_raw(), e.to_string())),
            }
        }
    }

    fn escalate(&self, record: &mut ProcessRecord) -> ProcessResult<()> {
        let Some(pid) = record.live_pid() else {
            return Ok(());
        };
        signal_pid(pid, Signal::SIGKILL)?;
        record.mark_signalled(Signal::SIGKILL.as_str());
        Ok(())
    }

    /// Best-effort wait, under one shared deadline, for pids we cannot
    /// `waitpid` on.
    fn await_foreign(
        &self,
        records: &mut [ProcessRecord],
        mut foreign: Vec<usize>,
        failures: &mut Vec<ProcessError>,
    ) {
        let deadline = Instant::now() + self.policy.foreign_wait;
        loop {
            foreign.retain(|&i| {
                let record = &mut records[i];
                let Some(pid) = record.live_pid() else {
                    return false;
                };
                match process_exists(pid) {
                    Ok(true) => true,
                    Ok(false) => {
                        self.finish(record, ReapOutcome::Vanished, false);
                        false
                    }
                    Err(e) => {
                        fail(record, e, failures);
                        false
                    }
                }
            });
            if foreign.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.policy.poll_interval);
        }

        for i in foreign {
            let record = &mut records[i];
            let pid = record.pid().map_or(0, |p| p.as_raw());
            fail(
                record,
                ProcessError::not_reapable(pid, "not a child of this process and still running"),
                failures,
            );
        }
    }

    fn finish(&self, record: &mut ProcessRecord, outcome: ReapOutcome, mark_forced: bool) {
        if let Some(pid) = record.pid() {
            debug!("pid {} {}", pid, outcome);
        }
        record.mark_reaped(outcome);
        if mark_forced && record.count_forced() && outcome.was_forced() {
            self.count_forced_kill(record);
        }
    }

    fn count_forced_kill(&self, record: &ProcessRecord) {
        if let Some(counter) = &self.forced_kills {
            if let Err(e) = counter.increment() {
                warn!("Failed to count forced kill of {:?}: {}", record.pid(), e);
            }
        }
    }
}

fn fail(record: &mut ProcessRecord, error: ProcessError, failures: &mut Vec<ProcessError>) {
    error!("{}", error);
    record.set_error(error.clone());
    failures.push(error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_mapping() {
        let pid = Pid::from_raw(10);
        assert_eq!(
            outcome_from_status(WaitStatus::Exited(pid, 3), false),
            Some(ReapOutcome::AlreadyExited)
        );
        assert_eq!(
            outcome_from_status(WaitStatus::Exited(pid, 3), true),
            Some(ReapOutcome::Exited(3))
        );
        assert_eq!(
            outcome_from_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false), true),
            Some(ReapOutcome::Killed(Signal::SIGKILL))
        );
        assert_eq!(outcome_from_status(WaitStatus::StillAlive, true), None);
    }

    #[test]
    fn test_forced_classification() {
        assert!(ReapOutcome::Killed(Signal::SIGALRM).was_forced());
        assert!(!ReapOutcome::Exited(0).was_forced());
        assert!(!ReapOutcome::AlreadyExited.was_forced());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ReapOutcome::Killed(Signal::SIGKILL).to_string(), "killed by SIGKILL");
        assert_eq!(ReapOutcome::Exited(2).to_string(), "exited with 2");
    }

    #[test]
    fn test_self_and_group_pids_are_skipped() {
        let coordinator = Coordinator::default();
        assert_eq!(
            coordinator
                .kill_and_wait(Pid::this(), Signal::SIGKILL, false)
                .unwrap(),
            ReapOutcome::Skipped
        );
        let outcomes = coordinator
            .kill_and_wait_many(&[Pid::from_raw(0), Pid::from_raw(-1)], Signal::SIGKILL, true)
            .unwrap();
        assert_eq!(outcomes, vec![ReapOutcome::Skipped, ReapOutcome::Skipped]);
    }

    #[test]
    fn test_missing_pid_vanishes() {
        let coordinator = Coordinator::default();
        let outcome = coordinator
            .kill_and_wait(Pid::from_raw(99_999_999), Signal::SIGKILL, true)
            .unwrap();
        assert_eq!(outcome, ReapOutcome::Vanished);
    }

    #[test]
    fn test_default_policy() {
        let policy = ReapPolicy::default();
        assert_eq!(policy.escalate_after, Duration::from_secs(5));
        assert_eq!(policy.max_interrupts, 3);
    }

    /// Interrupts the first `remaining` blocking waits, then defers to `waitpid`.
    #[derive(Debug)]
    struct InterruptedWaits {
        remaining: std::sync::atomic::AtomicU32,
        blocking_calls: std::sync::atomic::AtomicU32,
    }

    impl InterruptedWaits {
        fn new(remaining: u32) -> Self {
            Self {
                remaining: std::sync::atomic::AtomicU32::new(remaining),
                blocking_calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    impl WaitSource for Arc<InterruptedWaits> {
        fn wait(&self, pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<WaitStatus> {
            if options.is_none() {
                self.blocking_calls.fetch_add(1, Ordering::SeqCst);
                let interrupted = self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if interrupted {
                    return Err(Errno::EINTR);
                }
            }
            waitpid(pid, options)
        }
    }

    // Both tests flip the process-wide teardown flag.
    static TEARDOWN_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn spawn_sleeper() -> Pid {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_interrupted_wait_is_retried_outside_teardown() {
        let _serial = TEARDOWN_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        end_teardown();
        let waits = Arc::new(InterruptedWaits::new(5));
        let coordinator = Coordinator::default().with_wait_source(Arc::clone(&waits));
        let pid = spawn_sleeper();

        let outcome = coordinator.kill_and_wait(pid, Signal::SIGKILL, false).unwrap();

        assert_eq!(outcome, ReapOutcome::Killed(Signal::SIGKILL));
        assert_eq!(waits.blocking_calls.load(Ordering::SeqCst), 6);
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }

    #[test]
    fn test_interrupted_wait_gives_up_during_teardown() {
        let _serial = TEARDOWN_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        let waits = Arc::new(InterruptedWaits::new(u32::MAX));
        let policy = ReapPolicy {
            max_interrupts: 2,
            ..ReapPolicy::default()
        };
        let coordinator = Coordinator::new(policy).with_wait_source(Arc::clone(&waits));
        let pid = spawn_sleeper();

        begin_teardown();
        let result = coordinator.kill_and_wait(pid, Signal::SIGKILL, true);
        end_teardown();

        match result {
            Err(ProcessError::NotReapable { pid: failed, reason }) => {
                assert_eq!(failed, pid.as_raw());
                assert!(reason.contains("interrupted 3 times"), "{}", reason);
            }
            other => panic!("expected NotReapable, got {:?}", other),
        }
        assert_eq!(waits.blocking_calls.load(Ordering::SeqCst), 3);
        // The SIGKILL was delivered; only the wait was abandoned.
        assert!(matches!(
            waitpid(pid, None),
            Ok(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));
    }

    #[test]
    fn test_teardown_interrupt_escalates_soft_signal() {
        let _serial = TEARDOWN_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        let waits = Arc::new(InterruptedWaits::new(1));
        let policy = ReapPolicy {
            escalate_after: Duration::from_millis(50),
            ..ReapPolicy::default()
        };
        let coordinator = Coordinator::new(policy).with_wait_source(Arc::clone(&waits));
        let child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        std::thread::sleep(Duration::from_millis(200));

        begin_teardown();
        let outcome = coordinator.kill_and_wait(pid, Signal::SIGTERM, false);
        end_teardown();

        assert_eq!(outcome.unwrap(), ReapOutcome::Killed(Signal::SIGKILL));
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }
}
