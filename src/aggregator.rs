//! Per-thread occurrence counting
//!
//! Folds a [`SampleSet`] into per-thread counts of how many snapshots resolved
//! to each location key. Snapshots that resolve to nothing are dropped without
//! touching any count.

use crate::location::{LocationKey, LocationRules};
use crate::runtime::ThreadHandle;
use crate::sampler::SampleSet;
use std::collections::HashMap;

/// Location occurrences of a single thread within one cycle
pub type ThreadOccurrences = HashMap<LocationKey, u32>;

/// Per-thread location occurrences for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccurrenceMap {
    threads: HashMap<ThreadHandle, ThreadOccurrences>,
}

impl OccurrenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one occurrence of `key` on `thread`
    pub fn record(&mut self, thread: &ThreadHandle, key: LocationKey) {
        *self
            .threads
            .entry(thread.clone())
            .or_default()
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Occurrences of `key` on `thread` (0 if never seen)
    pub fn count(&self, thread: &ThreadHandle, key: &str) -> u32 {
        self.threads
            .get(thread)
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of all counts for `thread`
    pub fn thread_total(&self, thread: &ThreadHandle) -> u32 {
        self.threads
            .get(thread)
            .map(|keys| keys.values().sum())
            .unwrap_or(0)
    }

    pub fn get(&self, thread: &ThreadHandle) -> Option<&ThreadOccurrences> {
        self.threads.get(thread)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ThreadHandle, &ThreadOccurrences)> {
        self.threads.iter()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Count resolved locations per thread
pub fn aggregate(samples: &SampleSet, rules: &LocationRules) -> OccurrenceMap {
    let mut occurrences = OccurrenceMap::new();

    for (thread, snapshots) in samples.iter() {
        for snapshot in snapshots {
            if let Some(key) = rules.resolve(snapshot) {
                occurrences.record(thread, key);
            }
        }
    }

    occurrences
}
