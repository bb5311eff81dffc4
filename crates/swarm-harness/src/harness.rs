use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarm_common::PortRange;
use swarm_lock::SharedCounter;
use swarm_ports::PortAllocator;
use swarm_process::{
    begin_teardown, end_teardown, Coordinator, GroupSummary, ShutdownPolicy, Signal, WorkerGroup,
};
use tracing::{error, info, warn};

use crate::config::HarnessConfig;
use crate::ledger::PortLedger;
use crate::signals;
use crate::workload::{WorkerContext, Workload};

/// How often the parent checks on workers while the run is in progress.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Report for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub workload: String,
    pub workers: usize,
    pub elapsed_ms: u128,
    /// A stop signal arrived before the run duration elapsed.
    pub interrupted: bool,
    pub group: GroupSummary,
    /// Workers that only went away after the hard signal.
    pub forced_kills: u64,
    /// Port ranges released by the parent on behalf of workers.
    pub reclaimed_ranges: usize,
    /// `None` when the bitmap lock was abandoned by a killed worker.
    pub ports_still_reserved: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
}

impl RunSummary {
    /// Every spawned worker was reaped and no port was left behind.
    pub fn is_clean(&self) -> bool {
        self.group.unreaped == 0
            && self.group.not_spawned == 0
            && self.teardown_error.is_none()
            && self.ports_still_reserved == Some(0)
    }
}

/// Shared state for a run. Build it in the parent before any fork.
#[derive(Debug)]
pub struct Harness {
    config: HarnessConfig,
    range: PortRange,
    shutdown: ShutdownPolicy,
    allocator: PortAllocator,
    ledger: PortLedger,
    forced_kills: Arc<SharedCounter>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let range = config.port_range()?;
        let shutdown = config.shutdown_policy()?;
        let allocator = config
            .port_allocator()
            .context("Failed to set up the shared port map")?;
        let ledger = PortLedger::new().context("Failed to set up the port ledger")?;
        let forced_kills =
            Arc::new(SharedCounter::create().context("Failed to set up the kill counter")?);

        Ok(Self {
            config,
            range,
            shutdown,
            allocator,
            ledger,
            forced_kills,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn forced_kills(&self) -> u64 {
        self.forced_kills.get()
    }

    fn stop_signals(&self) -> Vec<Signal> {
        let mut stop = vec![Signal::SIGINT, Signal::SIGTERM];
        if let Some(graceful) = self.shutdown.graceful_signal {
            if !stop.contains(&graceful) {
                stop.push(graceful);
            }
        }
        stop
    }

    /// Forks the workers, lets them run for the configured duration (or
    /// until a stop signal), then tears them down and reclaims their ports.
    pub fn run(&self, workload: &dyn Workload) -> Result<RunSummary> {
        signals::reset_stop();
        signals::install_stop_handlers(&self.stop_signals())
            .context("Failed to install stop signal handlers")?;

        let workers = self.config.harness.workers;
        let run_duration = self.config.harness.run_duration;
        let coordinator = Coordinator::new(self.config.reap_policy())
            .with_forced_kill_counter(Arc::clone(&self.forced_kills));
        let mut group = WorkerGroup::new(workload.name(), coordinator);

        info!(
            "starting {} {} worker(s) for {:?}, ports {}",
            workers,
            workload.name(),
            run_duration,
            self.range
        );
        let started = Instant::now();
        group.spawn(workers, |index| {
            let ctx = WorkerContext::new(index, self.range, &self.allocator, &self.ledger);
            workload.run(&ctx)
        });

        let interrupted = self.wait(&mut group, started + run_duration);
        if interrupted {
            warn!("stop requested, tearing down early");
            begin_teardown();
        }

        let teardown = group.shutdown(&self.shutdown);
        end_teardown();

        let (reclaimed_ranges, ports_still_reserved) = self.reclaim_ports(&group);
        let summary = RunSummary {
            workload: workload.name().to_string(),
            workers,
            elapsed_ms: started.elapsed().as_millis(),
            interrupted,
            group: group.summary(),
            forced_kills: self.forced_kills.get(),
            reclaimed_ranges,
            ports_still_reserved,
            teardown_error: teardown.err().map(|e| e.to_string()),
        };
        info!(
            "run finished: {} spawned, {} forced kill(s), {} range(s) reclaimed",
            summary.group.spawned, summary.forced_kills, summary.reclaimed_ranges
        );
        Ok(summary)
    }

    /// Returns true when a stop signal cut the run short.
    fn wait(&self, group: &mut WorkerGroup, deadline: Instant) -> bool {
        loop {
            if signals::stop_requested() {
                return true;
            }
            group.reap_exited();
            if group.live_count() == 0 {
                info!("all workers finished before the run duration");
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }

    fn reclaim_ports(&self, group: &WorkerGroup) -> (usize, Option<usize>) {
        if group.live_count() > 0 {
            warn!(
                "{} worker(s) could not be reaped, leaving their ports reserved",
                group.live_count()
            );
            return (0, None);
        }
        if self.allocator.is_locked() {
            error!("port map lock was abandoned by a killed worker, ports not reclaimed");
            return (0, None);
        }
        let reclaimed = self.ledger.reclaim(&self.allocator);
        let remaining = match self.allocator.reserved_count() {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Failed to count reserved ports: {}", e);
                None
            }
        };
        (reclaimed, remaining)
    }
}
