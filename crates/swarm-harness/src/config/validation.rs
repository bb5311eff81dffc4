use super::*;
use anyhow::{anyhow, Result};

/// Validate the complete configuration
pub fn validate_config(config: &HarnessConfig) -> Result<()> {
    validate_harness_options(&config.harness)?;
    validate_port_options(config)?;
    validate_shutdown_options(config)?;
    validate_reap_options(&config.reap)?;
    Ok(())
}

/// Validate run-level options
fn validate_harness_options(options: &HarnessOptions) -> Result<()> {
    if options.workers == 0 {
        return Err(anyhow!("At least one worker must be configured"));
    }

    if options.workers > MAX_WORKERS {
        return Err(anyhow!(
            "Too many workers: {} (max {})",
            options.workers,
            MAX_WORKERS
        ));
    }

    if options.run_duration.is_zero() {
        return Err(anyhow!("Run duration must be greater than 0"));
    }

    match options.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(anyhow!(
            "Invalid log level: {}, must be one of: trace, debug, info, warn, error",
            options.log_level
        )),
    }
}

/// Validate port options
fn validate_port_options(config: &HarnessConfig) -> Result<()> {
    config.port_range()?;

    if config.ports.yield_every == 0 {
        return Err(anyhow!("ports.yield_every must be at least 1"));
    }

    if config.ports.host_bound_check && config.ports.proc_net_tables.is_empty() {
        return Err(anyhow!(
            "ports.proc_net_tables cannot be empty when host_bound_check is enabled"
        ));
    }

    Ok(())
}

/// Validate shutdown options
fn validate_shutdown_options(config: &HarnessConfig) -> Result<()> {
    let policy = config.shutdown_policy()?;

    if policy.graceful_signal == Some(Signal::SIGKILL) {
        return Err(anyhow!("SIGKILL cannot be used as the graceful signal"));
    }

    Ok(())
}

/// Validate reap options
fn validate_reap_options(options: &ReapOptions) -> Result<()> {
    if options.poll_interval.is_zero() {
        return Err(anyhow!("reap.poll_interval must be greater than 0"));
    }

    if options.escalate_after < options.poll_interval {
        return Err(anyhow!(
            "reap.escalate_after ({:?}) must be at least reap.poll_interval ({:?})",
            options.escalate_after,
            options.poll_interval
        ));
    }

    Ok(())
}
