use std::process::Command;

const CONFIG: &str = "
harness:
  workers: 3
  run_duration: 1s
  log_level: warn
ports:
  start: 52000
  host_bound_check: false
shutdown:
  grace_period: 2s
";

fn runner() -> Command {
    Command::new(env!("CARGO_BIN_EXE_swarm-runner"))
}

#[test]
fn test_run_prints_clean_summary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swarm.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let output = runner()
        .arg("--config")
        .arg(&path)
        .args(["--workers", "2"])
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["workload"], "port-listen");
    assert_eq!(summary["workers"], 2);
    assert_eq!(summary["group"]["spawned"], 2);
    assert_eq!(summary["group"]["unreaped"], 0);
    assert_eq!(summary["forced_kills"], 0);
    assert_eq!(summary["ports_still_reserved"], 0);
}

#[test]
fn test_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = runner()
        .arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}

#[test]
fn test_invalid_override_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swarm.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let output = runner()
        .arg("--config")
        .arg(&path)
        .args(["--workers", "0"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("At least one worker"));
}
