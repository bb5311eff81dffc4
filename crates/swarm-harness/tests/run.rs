use nix::sys::signal::{signal, SigHandler, Signal};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use swarm_harness::{
    signals, Harness, HarnessConfig, PortListenWorkload, WorkerContext, Workload, EXIT_SUCCESS,
};

// Runs share the process-wide stop flag.
static SERIAL: Mutex<()> = Mutex::new(());

fn config(workers: usize, run_duration: &str, start: u16, grace: &str) -> HarnessConfig {
    let yaml = format!(
        "
harness:
  workers: {workers}
  run_duration: {run_duration}
ports:
  start: {start}
  host_bound_check: false
shutdown:
  grace_period: {grace}
reap:
  escalate_after: 1s
"
    );
    HarnessConfig::load_from_string(&yaml).unwrap()
}

struct Stubborn;

impl Workload for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> i32 {
        unsafe { signal(Signal::SIGALRM, SigHandler::SigIgn) }.unwrap();
        let _grant = ctx.reserve_ports().unwrap();
        loop {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

struct Quick;

impl Workload for Quick {
    fn name(&self) -> &str {
        "quick"
    }

    fn run(&self, ctx: &WorkerContext<'_>) -> i32 {
        let grant = ctx.reserve_ports().unwrap();
        ctx.release_ports(&grant);
        EXIT_SUCCESS
    }
}

#[test]
fn test_listen_workers_stop_on_graceful_signal() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let harness = Harness::new(config(4, "300ms", 47000, "2s")).unwrap();

    let summary = harness.run(&PortListenWorkload::default()).unwrap();

    assert!(!summary.interrupted);
    assert_eq!(summary.group.spawned, 4);
    assert_eq!(summary.group.killed, 0);
    assert_eq!(summary.group.exited + summary.group.already_exited, 4);
    assert_eq!(summary.forced_kills, 0);
    assert_eq!(summary.reclaimed_ranges, 0);
    assert!(summary.is_clean(), "{:?}", summary);
}

#[test]
fn test_stubborn_workers_are_forced_and_ports_reclaimed() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let harness = Harness::new(config(3, "200ms", 48000, "200ms")).unwrap();

    let summary = harness.run(&Stubborn).unwrap();

    assert_eq!(summary.group.spawned, 3);
    assert_eq!(summary.group.killed, 3);
    assert_eq!(summary.forced_kills, 3);
    assert_eq!(summary.reclaimed_ranges, 3);
    assert_eq!(summary.ports_still_reserved, Some(0));
    assert!(summary.is_clean(), "{:?}", summary);
}

#[test]
fn test_run_ends_when_workers_finish_early() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let harness = Harness::new(config(4, "1m", 49000, "1s")).unwrap();

    let started = Instant::now();
    let summary = harness.run(&Quick).unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(summary.group.already_exited, 4);
    assert_eq!(summary.forced_kills, 0);
    assert!(summary.is_clean(), "{:?}", summary);
}

#[test]
fn test_stop_request_cuts_run_short() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let harness = Harness::new(config(2, "1m", 50000, "2s")).unwrap();

    let stopper = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(300));
        signals::request_stop();
    });
    let started = Instant::now();
    let summary = harness.run(&PortListenWorkload::default()).unwrap();
    stopper.join().unwrap();

    assert!(summary.interrupted);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(summary.group.unreaped, 0);
    assert!(summary.is_clean(), "{:?}", summary);
}

#[test]
fn test_summary_serializes() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let harness = Harness::new(config(1, "100ms", 51000, "1s")).unwrap();
    let summary = harness.run(&Quick).unwrap();

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["workload"], "quick");
    assert_eq!(json["group"]["spawned"], 1);
    assert_eq!(json["ports_still_reserved"], 0);
    assert!(json.get("teardown_error").is_none());
}
