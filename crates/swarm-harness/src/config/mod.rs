use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use swarm_common::PortRange;
use swarm_ports::oracle::DEFAULT_PROC_NET_TABLES;
use swarm_ports::{NoBoundPorts, PortAllocator, ProcNetOracle};
use swarm_process::{ReapPolicy, ShutdownPolicy, Signal};

pub mod validation;

/// Upper bound on workers per run (size of the shared port ledger).
pub const MAX_WORKERS: usize = 1024;

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub harness: HarnessOptions,
    #[serde(default)]
    pub ports: PortOptions,
    #[serde(default)]
    pub shutdown: ShutdownOptions,
    #[serde(default)]
    pub reap: ReapOptions,
}

/// Run-level options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessOptions {
    pub workers: usize,
    #[serde(with = "duration_serde")]
    pub run_duration: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Port reservation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortOptions {
    #[serde(default = "default_start_port")]
    pub start: i64,
    /// Defaults to `start` (one port per worker).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
    #[serde(default = "default_true")]
    pub host_bound_check: bool,
    #[serde(default = "default_proc_net_tables")]
    pub proc_net_tables: Vec<PathBuf>,
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            start: default_start_port(),
            end: None,
            yield_every: default_yield_every(),
            host_bound_check: true,
            proc_net_tables: default_proc_net_tables(),
        }
    }
}

/// Group teardown options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownOptions {
    /// `None` skips the graceful phase.
    #[serde(default = "default_graceful_signal")]
    pub graceful_signal: Option<String>,
    #[serde(default = "default_grace_period", with = "duration_serde")]
    pub grace_period: Duration,
    #[serde(default = "default_hard_signal")]
    pub hard_signal: String,
    #[serde(default = "default_true")]
    pub mark_forced: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            graceful_signal: default_graceful_signal(),
            grace_period: default_grace_period(),
            hard_signal: default_hard_signal(),
            mark_forced: true,
        }
    }
}

/// Reaping options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapOptions {
    #[serde(default = "default_escalate_after", with = "duration_serde")]
    pub escalate_after: Duration,
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_interrupts")]
    pub max_interrupts: u32,
    #[serde(default = "default_foreign_wait", with = "duration_serde")]
    pub foreign_wait: Duration,
}

impl Default for ReapOptions {
    fn default() -> Self {
        let policy = ReapPolicy::default();
        Self {
            escalate_after: policy.escalate_after,
            poll_interval: policy.poll_interval,
            max_interrupts: policy.max_interrupts,
            foreign_wait: policy.foreign_wait,
        }
    }
}

/// Parses `SIGALRM`, `ALRM` or `alrm`.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).map_err(|_| anyhow!("Unknown signal: {}", name))
}

impl HarnessConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: HarnessConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    /// Ports each worker asks for.
    pub fn port_range(&self) -> Result<PortRange> {
        let end = self.ports.end.unwrap_or(self.ports.start);
        PortRange::from_raw(self.ports.start, end).map_err(|e| anyhow!(e))
    }

    /// Builds the shared allocator. Must run before workers are forked.
    pub fn port_allocator(&self) -> swarm_common::Result<PortAllocator> {
        let allocator = if self.ports.host_bound_check {
            PortAllocator::with_oracle(ProcNetOracle::new(self.ports.proc_net_tables.clone()))?
        } else {
            PortAllocator::with_oracle(NoBoundPorts)?
        };
        Ok(allocator.with_yield_every(self.ports.yield_every))
    }

    pub fn graceful_signal(&self) -> Result<Option<Signal>> {
        self.shutdown
            .graceful_signal
            .as_deref()
            .map(parse_signal)
            .transpose()
    }

    pub fn shutdown_policy(&self) -> Result<ShutdownPolicy> {
        Ok(ShutdownPolicy {
            graceful_signal: self.graceful_signal()?,
            grace_period: self.shutdown.grace_period,
            hard_signal: parse_signal(&self.shutdown.hard_signal)?,
            mark_forced: self.shutdown.mark_forced,
            poll_interval: self.reap.poll_interval,
        })
    }

    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            escalate_after: self.reap.escalate_after,
            poll_interval: self.reap.poll_interval,
            max_interrupts: self.reap.max_interrupts,
            foreign_wait: self.reap.foreign_wait,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_start_port() -> i64 {
    5000
}

fn default_yield_every() -> usize {
    swarm_ports::DEFAULT_YIELD_EVERY
}

fn default_true() -> bool {
    true
}

fn default_proc_net_tables() -> Vec<PathBuf> {
    DEFAULT_PROC_NET_TABLES.iter().map(PathBuf::from).collect()
}

fn default_graceful_signal() -> Option<String> {
    Some("SIGALRM".to_string())
}

fn default_grace_period() -> Duration {
    Duration::from_secs(2)
}

fn default_hard_signal() -> String {
    "SIGKILL".to_string()
}

fn default_escalate_after() -> Duration {
    ReapPolicy::default().escalate_after
}

fn default_poll_interval() -> Duration {
    ReapPolicy::default().poll_interval
}

fn default_max_interrupts() -> u32 {
    ReapPolicy::default().max_interrupts
}

fn default_foreign_wait() -> Duration {
    ReapPolicy::default().foreign_wait
}

// Durations as "250ms", "2s" or "1m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // Check for "ms" BEFORE "s" since "ms" ends with 's'
        if let Some(num_str) = s.strip_suffix("ms") {
            let millis: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_millis(millis))
        } else if let Some(num_str) = s.strip_suffix('s') {
            let secs: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(secs))
        } else if let Some(num_str) = s.strip_suffix('m') {
            let mins: u64 = num_str.parse().map_err(|_| format!("Invalid duration: {}", s))?;
            Ok(Duration::from_secs(mins * 60))
        } else {
            Err(format!("Duration must end with 's', 'ms', or 'm': {}", s))
        }
    }
}
