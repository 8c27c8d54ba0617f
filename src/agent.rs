//! Agent lifecycle: sampling loop, background thread and process wiring
//!
//! One cycle is `sample → aggregate → attribute`. [`Agent::run`] repeats it
//! until the ticker reports cancellation; [`Agent::spawn`] moves that loop onto
//! the `cpu-sampler` thread and [`start`] adds the metrics endpoint on top.

use crate::aggregator::aggregate;
use crate::attribution::{AttributionSummary, CpuTimeAttributor};
use crate::config::{AgentProperties, ConfigError};
use crate::exposition::{ExpositionError, MetricsServer};
use crate::location::LocationRules;
use crate::procfs::ProcfsRuntime;
use crate::registry::{MetricRegistry, RegistryError};
use crate::runtime::{CpuTimeReader, ThreadInspector};
use crate::sampler::{SamplerSettings, ShutdownTicker, StackSampler, Tick, Ticker};
use crate::stack_capture::CaptureError;
use crossbeam::channel::{self, Sender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the background sampling thread
pub const SAMPLER_THREAD_NAME: &str = "cpu-sampler";

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Thread CPU time is not supported on this platform")]
    CpuTimeUnsupported,

    #[error("Stack capture unavailable: {0}")]
    Capture(#[from] CaptureError),

    #[error("Metric registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Metrics endpoint error: {0}")]
    Exposition(#[from] ExpositionError),

    #[error("Failed to spawn sampler thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Sampler thread panicked")]
    Panicked,
}

/// What one sampling cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleReport {
    pub probes: u32,
    pub threads_sampled: usize,
    pub snapshots: usize,
    /// Threads with at least one snapshot resolved to a monitored location
    pub threads_resolved: usize,
    pub attribution: AttributionSummary,
    /// Cancellation arrived before the window completed
    pub interrupted: bool,
}

/// Sampling agent bound to one runtime and one registry
pub struct Agent {
    inspector: Arc<dyn ThreadInspector>,
    cpu_reader: Arc<dyn CpuTimeReader>,
    rules: LocationRules,
    settings: SamplerSettings,
    attributor: CpuTimeAttributor,
    registry: Arc<MetricRegistry>,
}

impl Agent {
    /// Validate `properties` and prepare an agent with an empty registry
    pub fn new(
        properties: &AgentProperties,
        inspector: Arc<dyn ThreadInspector>,
        cpu_reader: Arc<dyn CpuTimeReader>,
    ) -> Result<Self, AgentError> {
        properties.validate()?;
        if !cpu_reader.cpu_time_supported() {
            return Err(AgentError::CpuTimeUnsupported);
        }

        let settings = properties.sampler_settings();
        Ok(Self {
            inspector,
            cpu_reader,
            rules: properties.rules(),
            attributor: CpuTimeAttributor::for_settings(&settings),
            settings,
            registry: Arc::new(MetricRegistry::new()?),
        })
    }

    pub fn registry(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Sample one window, then attribute what was collected
    ///
    /// A cancelled window is still attributed, over the probes it completed.
    pub fn run_cycle(&self, ticker: &mut dyn Ticker) -> CycleReport {
        let samples = StackSampler::new(self.inspector.as_ref(), self.settings).sample(ticker);
        let occurrences = aggregate(&samples, &self.rules);
        let attribution =
            self.attributor
                .attribute(&occurrences, self.cpu_reader.as_ref(), &self.registry);

        CycleReport {
            probes: samples.probes(),
            threads_sampled: samples.thread_count(),
            snapshots: samples.snapshot_count(),
            threads_resolved: occurrences.thread_count(),
            attribution,
            interrupted: samples.interrupted(),
        }
    }

    /// Run cycles until the ticker reports cancellation
    pub fn run(&self, ticker: &mut dyn Ticker) {
        let mut cycles: u64 = 0;
        loop {
            let started = Instant::now();
            let report = self.run_cycle(ticker);
            cycles += 1;
            debug!(
                cycle = cycles,
                probes = report.probes,
                threads = report.threads_sampled,
                snapshots = report.snapshots,
                keys_updated = report.attribution.keys_updated,
                seconds = report.attribution.seconds_attributed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sampling cycle complete"
            );

            if report.interrupted {
                break;
            }
            if ticker.wait(self.settings.probe_interval) == Tick::Cancelled {
                break;
            }
        }
        info!(cycles, "sampling loop stopped");
    }

    /// Move the sampling loop onto its own thread
    pub fn spawn(self) -> Result<AgentHandle, AgentError> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let registry = self.registry();

        let thread = thread::Builder::new()
            .name(SAMPLER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut ticker = ShutdownTicker::new(shutdown_rx);
                self.run(&mut ticker);
            })
            .map_err(AgentError::Spawn)?;

        Ok(AgentHandle {
            shutdown: shutdown_tx,
            thread,
            registry,
        })
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("rules", &self.rules)
            .field("settings", &self.settings)
            .field("attributor", &self.attributor)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Handle on the running sampler thread
#[derive(Debug)]
pub struct AgentHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
    registry: Arc<MetricRegistry>,
}

impl AgentHandle {
    pub fn registry(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Cancel the loop and wait for the thread to exit
    pub fn shutdown(self) -> Result<(), AgentError> {
        // A full channel means shutdown was already requested
        let _ = self.shutdown.try_send(());
        self.thread.join().map_err(|_| AgentError::Panicked)
    }
}

/// Agent plus metrics endpoint, as started inside a host process
#[derive(Debug)]
pub struct RunningAgent {
    handle: AgentHandle,
    server: MetricsServer,
}

impl RunningAgent {
    pub fn registry(&self) -> Arc<MetricRegistry> {
        self.handle.registry()
    }

    /// Address the metrics endpoint actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Stop sampling, then stop serving
    pub fn shutdown(self) -> Result<(), AgentError> {
        self.handle.shutdown()?;
        self.server.shutdown()?;
        info!("agent stopped");
        Ok(())
    }
}

/// Start sampling this process and serve the results
pub fn start(properties: &AgentProperties) -> Result<RunningAgent, AgentError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        monitored = ?properties.filter_method_names,
        grouped = ?properties.grouping_method_names,
        window_ms = properties.sampling_window_ms,
        interval_ms = properties.probe_interval_ms,
        hide_own_thread = properties.hide_own_thread(),
        "starting CPU time exporter"
    );

    properties.validate()?;
    let listen_addr = properties.listen_addr()?;

    let runtime = Arc::new(ProcfsRuntime::new()?);
    let agent = Agent::new(properties, runtime.clone(), runtime)?;
    let server = MetricsServer::bind(listen_addr, agent.registry())?;
    let handle = agent.spawn()?;

    info!(addr = %server.local_addr(), "agent running");
    Ok(RunningAgent { handle, server })
}
