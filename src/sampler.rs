//! Stack sampling over a fixed window
//!
//! One sampling cycle probes every live thread `window / interval` times. On
//! each probe a thread that is runnable contributes one stack snapshot; threads
//! that are waiting, blocked or gone contribute nothing. Between probes the
//! sampler waits on a [`Ticker`], which is also where cancellation is observed.

use crate::runtime::{StackSnapshot, ThreadHandle, ThreadInspector};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

/// Default sampling window (one cycle)
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Default pause between two probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of waiting on a ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The requested period passed
    Elapsed,
    /// Shutdown was requested while waiting
    Cancelled,
}

/// Timer abstraction the sampling loop sleeps on
pub trait Ticker {
    fn wait(&mut self, period: Duration) -> Tick;
}

/// Ticker backed by a shutdown channel
///
/// Waiting is `recv_timeout`, so a message or a dropped sender ends the wait
/// immediately with [`Tick::Cancelled`].
#[derive(Debug, Clone)]
pub struct ShutdownTicker {
    shutdown: Receiver<()>,
}

impl ShutdownTicker {
    pub fn new(shutdown: Receiver<()>) -> Self {
        Self { shutdown }
    }
}

impl Ticker for ShutdownTicker {
    fn wait(&mut self, period: Duration) -> Tick {
        match self.shutdown.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => Tick::Elapsed,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Tick::Cancelled,
        }
    }
}

/// Window, probe interval and own-thread visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSettings {
    pub window: Duration,
    pub probe_interval: Duration,
    /// Skip the sampling thread itself during enumeration
    pub hide_own_thread: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            hide_own_thread: false,
        }
    }
}

impl SamplerSettings {
    /// Nominal number of probes per cycle, at least one
    pub fn probes_per_window(&self) -> u32 {
        let interval = self.probe_interval.as_nanos().max(1);
        let probes = self.window.as_nanos() / interval;
        probes.clamp(1, u128::from(u32::MAX)) as u32
    }
}

/// Snapshots captured during one cycle, keyed by thread
#[derive(Debug, Default)]
pub struct SampleSet {
    samples: HashMap<ThreadHandle, Vec<StackSnapshot>>,
    probes: u32,
    interrupted: bool,
}

impl SampleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot to a thread's sequence
    pub fn record(&mut self, thread: ThreadHandle, snapshot: StackSnapshot) {
        self.samples.entry(thread).or_default().push(snapshot);
    }

    pub fn snapshots(&self, thread: &ThreadHandle) -> Option<&[StackSnapshot]> {
        self.samples.get(thread).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ThreadHandle, &[StackSnapshot])> {
        self.samples.iter().map(|(t, s)| (t, s.as_slice()))
    }

    /// Number of threads with at least one snapshot
    pub fn thread_count(&self) -> usize {
        self.samples.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Probes actually taken this cycle
    pub fn probes(&self) -> u32 {
        self.probes
    }

    /// Whether the cycle ended early because of cancellation
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }
}

/// Captures bursts of stack snapshots for every live thread
pub struct StackSampler<'a> {
    inspector: &'a dyn ThreadInspector,
    settings: SamplerSettings,
}

impl<'a> StackSampler<'a> {
    pub fn new(inspector: &'a dyn ThreadInspector, settings: SamplerSettings) -> Self {
        Self {
            inspector,
            settings,
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Run one sampling cycle
    ///
    /// Returns early (with whatever was collected) if the ticker reports
    /// cancellation.
    pub fn sample(&self, ticker: &mut dyn Ticker) -> SampleSet {
        let probes = self.settings.probes_per_window();
        let own_tid = self.inspector.current_thread_id();
        let mut set = SampleSet::new();

        for _ in 0..probes {
            self.probe(own_tid, &mut set);
            set.probes += 1;

            if ticker.wait(self.settings.probe_interval) == Tick::Cancelled {
                set.interrupted = true;
                break;
            }
        }

        trace!(
            probes = set.probes,
            threads = set.thread_count(),
            snapshots = set.snapshot_count(),
            interrupted = set.interrupted,
            "sampling cycle collected"
        );
        set
    }

    /// Capture one snapshot of every runnable thread
    fn probe(&self, own_tid: u32, set: &mut SampleSet) {
        for thread in self.inspector.live_threads() {
            if self.settings.hide_own_thread && thread.tid == own_tid {
                continue;
            }

            // A thread may exit between enumeration and inspection
            let Some(state) = self.inspector.state(&thread) else {
                continue;
            };
            if !state.is_runnable() {
                continue;
            }

            match self.inspector.stack_trace(&thread) {
                Some(snapshot) => set.record(thread, snapshot),
                None => trace!(thread = %thread, "stack capture skipped"),
            }
        }
    }
}
