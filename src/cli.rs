//! CLI argument parsing for the exporter binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cpu-time-exporter")]
#[command(version)]
#[command(
    about = "Sample thread stacks and export estimated CPU time per code location to Prometheus",
    long_about = None
)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to $CPU_TIME_EXPORTER_CONFIG, then ./config.toml
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the metrics endpoint address from the configuration
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Enable trace-level logging
    #[arg(long)]
    pub debug: bool,

    /// Synthetic CPU-bound worker threads to run alongside the agent
    #[arg(short, long, value_name = "N", default_value = "0")]
    pub workers: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long, value_name = "SECS")]
    pub duration: Option<u64>,
}
