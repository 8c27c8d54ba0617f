//! Property-based tests for the sampling pipeline
//!
//! Core properties covered:
//! 1. Occurrence counts never exceed captured snapshots
//! 2. Group rules win over concrete frame names
//! 3. Unmonitored stacks never reach the registry
//! 4. Registry values only grow
//! 5. Repeated registration of one key yields one entry

use cpu_time_exporter::aggregator::aggregate;
use cpu_time_exporter::attribution::CpuTimeAttributor;
use cpu_time_exporter::location::{LocationKey, LocationRules, PrefixRules};
use cpu_time_exporter::registry::MetricRegistry;
use cpu_time_exporter::runtime::{CpuTimeReader, StackFrame, StackSnapshot, ThreadHandle};
use cpu_time_exporter::sampler::SampleSet;
use proptest::prelude::*;

const SCOPES: &[&str] = &[
    "app.service",
    "app.db.pool",
    "lib.json",
    "std.thread",
    "app.web.handler",
];

fn frame() -> impl Strategy<Value = StackFrame> {
    (prop::sample::select(SCOPES), "[a-z]{1,6}")
        .prop_map(|(scope, op)| StackFrame::new(scope, op))
}

fn snapshot() -> impl Strategy<Value = StackSnapshot> {
    prop::collection::vec(frame(), 0..8).prop_map(StackSnapshot::new)
}

/// Up to four threads, each with up to 30 snapshots
fn sample_set() -> impl Strategy<Value = SampleSet> {
    prop::collection::vec(prop::collection::vec(snapshot(), 0..30), 1..5).prop_map(|threads| {
        let mut set = SampleSet::new();
        for (tid, snapshots) in threads.into_iter().enumerate() {
            let thread = ThreadHandle::new(tid as u32, format!("t{tid}"));
            for snapshot in snapshots {
                set.record(thread.clone(), snapshot);
            }
        }
        set
    })
}

fn rules() -> LocationRules {
    LocationRules::new(PrefixRules::new(["app"]), PrefixRules::new(["app.db"]))
}

struct ConstantCpu(u64);

impl CpuTimeReader for ConstantCpu {
    fn cpu_time_supported(&self) -> bool {
        true
    }

    fn cpu_time_nanos(&self, _thread: &ThreadHandle) -> Option<u64> {
        Some(self.0)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_occurrences_bounded_by_snapshots(samples in sample_set()) {
        let occurrences = aggregate(&samples, &rules());

        for (thread, snapshots) in samples.iter() {
            prop_assert!(occurrences.thread_total(thread) as usize <= snapshots.len());
        }
    }

    #[test]
    fn prop_grouped_scope_never_reported_concretely(samples in sample_set()) {
        let occurrences = aggregate(&samples, &rules());

        for (_, locations) in occurrences.iter() {
            for key in locations.keys() {
                prop_assert!(
                    key.as_str() == "app.db" || !key.as_str().starts_with("app.db"),
                    "grouped key leaked: {}", key
                );
            }
        }
    }

    #[test]
    fn prop_every_key_is_monitored(samples in sample_set()) {
        let rules = rules();
        let occurrences = aggregate(&samples, &rules);

        for (_, locations) in occurrences.iter() {
            for key in locations.keys() {
                prop_assert!(rules.is_monitored(key.as_str()));
            }
        }
    }

    #[test]
    fn prop_attribution_is_monotone(
        samples in sample_set(),
        cpu_nanos in prop::collection::vec(0u64..5_000_000_000, 1..6),
    ) {
        let registry = MetricRegistry::new().unwrap();
        let occurrences = aggregate(&samples, &rules());
        let attributor = CpuTimeAttributor::default();

        let mut previous = registry.snapshot();
        for nanos in cpu_nanos {
            attributor.attribute(&occurrences, &ConstantCpu(nanos), &registry);
            let current = registry.snapshot();

            for before in &previous {
                let after = current
                    .iter()
                    .find(|entry| entry.key == before.key)
                    .map(|entry| entry.seconds);
                prop_assert!(after.is_some());
                prop_assert!(after.unwrap() >= before.seconds);
            }
            previous = current;
        }
    }

    #[test]
    fn prop_repeated_observe_single_entry(
        name in "app\\.[a-z]{1,8}\\.[a-z]{1,8}",
        deltas in prop::collection::vec(0.0f64..10.0, 1..20),
    ) {
        let registry = MetricRegistry::new().unwrap();
        let key = LocationKey::new(name.as_str());
        let expected: f64 = deltas.iter().sum();

        for delta in &deltas {
            registry.observe(&key, *delta);
        }

        prop_assert_eq!(registry.len(), 1);
        let value = registry.value(&name).unwrap();
        prop_assert!((value - expected).abs() < 1e-6);
    }

    #[test]
    fn prop_resolve_is_deterministic(snapshot in snapshot()) {
        let rules = rules();
        prop_assert_eq!(rules.resolve(&snapshot), rules.resolve(&snapshot));
    }
}
