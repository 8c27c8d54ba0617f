//! cpu-time-exporter - in-process CPU time attribution by stack sampling
//!
//! The agent periodically samples the stacks of every runnable thread in the
//! host process, resolves each stack to a monitored code location, and splits
//! each thread's CPU time over the locations it was seen in. Accumulated
//! seconds are exported as the Prometheus gauge family
//! `method_cpu_time_in_seconds{method_name="..."}`.
//!
//! Pipeline, one cycle per sampling window:
//! [`sampler`] → [`aggregator`] → [`attribution`] → [`registry`] → [`exposition`]

pub mod agent;
pub mod aggregator;
pub mod attribution;
pub mod cli;
pub mod config;
pub mod exposition;
pub mod location;
pub mod procfs;
pub mod registry;
pub mod runtime;
pub mod sampler;
pub mod stack_capture;
