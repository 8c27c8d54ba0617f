// Binary startup and exit behaviour

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn exporter() -> Command {
    let mut cmd = Command::cargo_bin("cpu-time-exporter").unwrap();
    cmd.env_remove("CPU_TIME_EXPORTER_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_missing_config_fails_without_monitored_names() {
    let dir = TempDir::new().unwrap();

    exporter()
        .current_dir(dir.path())
        .args(["--duration", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("filter-method-names"));
}

#[test]
fn test_empty_filter_list_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("exporter.toml");
    fs::write(&config, "filter-method-names = \"  , \"\n").unwrap();

    exporter()
        .arg("--config")
        .arg(&config)
        .args(["--duration", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No monitored names"));
}

#[test]
fn test_config_path_from_environment() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("env.toml");
    fs::write(
        &config,
        "filter-method-names = [\"app\"]\nsampling-window-ms = 5\nprobe-interval-ms = 10\n",
    )
    .unwrap();

    exporter()
        .env("CPU_TIME_EXPORTER_CONFIG", &config)
        .args(["--duration", "1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid sampling"));
}

#[test]
fn test_invalid_listen_flag_rejected_by_parser() {
    exporter()
        .args(["--listen", "nowhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--listen"));
}

#[test]
fn test_runs_for_duration_and_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("exporter.toml");
    fs::write(
        &config,
        "filter-method-names = [\"cpu_time_exporter\"]\nsampling-window-ms = 100\n",
    )
    .unwrap();

    exporter()
        .arg("--config")
        .arg(&config)
        .args(["--listen", "127.0.0.1:0", "--workers", "1", "--duration", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("starting CPU time exporter"));
}

#[test]
fn test_version_flag() {
    exporter()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}
