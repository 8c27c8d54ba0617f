//! CPU-time attribution for sampled locations
//!
//! Each thread's total CPU time is split over the locations its snapshots
//! resolved to, proportionally to the occurrence counts:
//!
//! ```text
//! attributed = cpu_seconds * (occurrences / divisor)
//! ```
//!
//! The divisor is the nominal number of probes per cycle (100 at the default
//! 1000 ms window and 10 ms interval). The estimate assumes CPU was consumed
//! uniformly over the window; shares across keys of one thread are not forced
//! to sum to one.

use crate::aggregator::OccurrenceMap;
use crate::registry::MetricRegistry;
use crate::runtime::CpuTimeReader;
use crate::sampler::SamplerSettings;
use tracing::{debug, trace};

/// Divisor matching the default window/interval ratio
pub const DEFAULT_DIVISOR: f64 = 100.0;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// What one attribution pass did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttributionSummary {
    /// Threads whose CPU time was distributed
    pub threads_attributed: usize,
    /// Threads skipped because CPU time was unavailable
    pub threads_skipped: usize,
    /// Registry updates performed
    pub keys_updated: usize,
    /// Sum of all deltas added this pass
    pub seconds_attributed: f64,
}

/// Turns occurrence counts into CPU-second deltas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTimeAttributor {
    divisor: f64,
}

impl Default for CpuTimeAttributor {
    fn default() -> Self {
        Self {
            divisor: DEFAULT_DIVISOR,
        }
    }
}

impl CpuTimeAttributor {
    /// Attributor with an explicit divisor (non-positive falls back to the default)
    pub fn with_divisor(divisor: f64) -> Self {
        if divisor.is_finite() && divisor > 0.0 {
            Self { divisor }
        } else {
            Self::default()
        }
    }

    /// Attributor whose divisor is the configured probes per window
    pub fn for_settings(settings: &SamplerSettings) -> Self {
        Self::with_divisor(f64::from(settings.probes_per_window()))
    }

    pub fn divisor(&self) -> f64 {
        self.divisor
    }

    /// Share of `cpu_seconds` attributed to a location seen `occurrences` times
    pub fn share(&self, cpu_seconds: f64, occurrences: u32) -> f64 {
        cpu_seconds * (f64::from(occurrences) / self.divisor)
    }

    /// Distribute each thread's CPU time over its locations and store the deltas
    pub fn attribute(
        &self,
        occurrences: &OccurrenceMap,
        reader: &dyn CpuTimeReader,
        registry: &MetricRegistry,
    ) -> AttributionSummary {
        let mut summary = AttributionSummary::default();

        for (thread, locations) in occurrences.iter() {
            let Some(nanos) = reader.cpu_time_nanos(thread) else {
                debug!(thread = %thread, "CPU time unavailable, skipping thread this cycle");
                summary.threads_skipped += 1;
                continue;
            };

            let cpu_seconds = nanos as f64 / NANOS_PER_SECOND;
            summary.threads_attributed += 1;

            for (key, &count) in locations {
                let delta = self.share(cpu_seconds, count);
                registry.observe(key, delta);
                summary.keys_updated += 1;
                summary.seconds_attributed += delta;
                trace!(
                    thread = %thread,
                    key = %key,
                    occurrences = count,
                    seconds = delta,
                    "attributed CPU time"
                );
            }
        }

        summary
    }
}
