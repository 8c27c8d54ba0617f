use anyhow::{Context, Result};
use clap::Parser;
use cpu_time_exporter::agent;
use cpu_time_exporter::cli::Cli;
use cpu_time_exporter::config::{config_path, AgentProperties};
use crossbeam::channel::{self, RecvTimeoutError};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize tracing; `--debug` forces trace level, otherwise the configured level
fn init_tracing(debug: bool, level: Level) {
    let level = if debug { Level::TRACE } else { level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Busy loop the synthetic workers spend their time in
#[inline(never)]
fn spin(rounds: u64) -> u64 {
    let mut acc: u64 = 0x9e37_79b9_7f4a_7c15;
    for i in 0..rounds {
        acc = black_box(acc.rotate_left(5) ^ i).wrapping_mul(0x100_0000_01b3);
    }
    acc
}

fn spawn_workers(count: usize, stop: &Arc<AtomicBool>) -> Result<Vec<thread::JoinHandle<()>>> {
    (0..count)
        .map(|i| {
            let stop = Arc::clone(stop);
            thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        black_box(spin(100_000));
                    }
                })
                .with_context(|| format!("Failed to spawn worker thread {i}"))
        })
        .collect()
}

fn run(args: Cli) -> Result<()> {
    let path = config_path(args.config.as_deref());
    let (mut properties, source) = AgentProperties::load(&path);
    if let Some(listen) = args.listen {
        properties.listen_address = listen.to_string();
    }

    init_tracing(args.debug, properties.logger_level());
    source.log();

    let running = agent::start(&properties).context("Failed to start agent")?;

    let stop = Arc::new(AtomicBool::new(false));
    let workers = spawn_workers(args.workers, &stop)?;
    if !workers.is_empty() {
        info!(workers = workers.len(), "synthetic workers running");
    }

    let (interrupt_tx, interrupt_rx) = channel::bounded::<()>(1);
    ctrlc_channel(interrupt_tx)?;

    match args.duration {
        Some(secs) => match interrupt_rx.recv_timeout(Duration::from_secs(secs)) {
            Err(RecvTimeoutError::Timeout) => info!(secs, "duration elapsed"),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => info!("interrupted"),
        },
        None => {
            let _ = interrupt_rx.recv();
            info!("interrupted");
        }
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }
    running.shutdown().context("Failed to stop agent")?;
    Ok(())
}

/// Forward Ctrl-C to a channel from a small tokio runtime thread
fn ctrlc_channel(tx: channel::Sender<()>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("Failed to build signal runtime")?;
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.try_send(());
                }
            });
        })
        .context("Failed to spawn signal listener")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    run(args)
}
