//! Registry of accumulated CPU seconds per location
//!
//! Each location key owns one gauge in the `method_cpu_time_in_seconds` family,
//! labelled `method_name="<key>"`. The key set only grows: an entry is created
//! the first time a key is observed and is never removed.
//!
//! The key set sits behind an `RwLock`; the values are atomic gauges. The
//! attribution thread takes the write lock only to insert an unseen key, so
//! scrapes never wait for a value update.

use crate::location::LocationKey;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Metric family name
pub const METRIC_NAME: &str = "method_cpu_time_in_seconds";

/// Label carrying the location key
pub const METRIC_LABEL: &str = "method_name";

const METRIC_HELP: &str = "Estimated CPU time attributed to a code location, in seconds";

/// Errors raised by the metric registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metric text is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// One exported row: location key and accumulated seconds
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    pub key: LocationKey,
    pub seconds: f64,
}

/// Location key → accumulated CPU seconds
pub struct MetricRegistry {
    registry: Registry,
    family: GaugeVec,
    entries: RwLock<HashMap<LocationKey, Gauge>>,
}

impl MetricRegistry {
    /// Create an empty registry with the gauge family registered
    pub fn new() -> Result<Self, RegistryError> {
        let registry = Registry::new();
        let family = GaugeVec::new(Opts::new(METRIC_NAME, METRIC_HELP), &[METRIC_LABEL])?;
        registry.register(Box::new(family.clone()))?;

        Ok(Self {
            registry,
            family,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Add `delta_seconds` to `key`, creating the entry on first sight
    ///
    /// Negative and non-finite deltas are rejected so values stay monotone.
    pub fn observe(&self, key: &LocationKey, delta_seconds: f64) {
        if !delta_seconds.is_finite() || delta_seconds < 0.0 {
            warn!(key = %key, delta = delta_seconds, "ignoring invalid CPU time delta");
            return;
        }

        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(gauge) = entries.get(key) {
                gauge.add(delta_seconds);
                trace!(key = %key, value = gauge.get(), "updated location");
                return;
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let gauge = entries.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "gauge registered for location");
            self.family.with_label_values(&[key.as_str()])
        });
        gauge.add(delta_seconds);
        trace!(key = %key, value = gauge.get(), "updated location");
    }

    /// Current value of one key
    pub fn value(&self, key: &str) -> Option<f64> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(Gauge::get)
    }

    /// Point-in-time read of every entry, sorted by key
    pub fn snapshot(&self) -> Vec<MetricEntry> {
        let mut rows: Vec<MetricEntry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, gauge)| MetricEntry {
                key: key.clone(),
                seconds: gauge.get(),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render all entries in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, RegistryError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
