// Shared test runtime: a process whose threads, states, stacks and CPU times
// are fixed up front.

#![allow(dead_code)]

use cpu_time_exporter::config::AgentProperties;
use cpu_time_exporter::runtime::{
    CpuTimeReader, StackFrame, StackSnapshot, ThreadHandle, ThreadInspector, ThreadState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One scripted thread
#[derive(Debug, Clone)]
pub struct ScriptedThread {
    pub handle: ThreadHandle,
    pub state: Option<ThreadState>,
    /// Frames innermost first, as `(scope, operation)`
    pub frames: Vec<(String, String)>,
    pub cpu_nanos: Option<u64>,
}

impl ScriptedThread {
    pub fn runnable(tid: u32, frames: &[(&str, &str)], cpu_nanos: u64) -> Self {
        Self {
            handle: ThreadHandle::new(tid, format!("thread-{tid}")),
            state: Some(ThreadState::Runnable),
            frames: frames
                .iter()
                .map(|(s, o)| (s.to_string(), o.to_string()))
                .collect(),
            cpu_nanos: Some(cpu_nanos),
        }
    }

    pub fn with_state(mut self, state: Option<ThreadState>) -> Self {
        self.state = state;
        self
    }

    pub fn without_cpu_time(mut self) -> Self {
        self.cpu_nanos = None;
        self
    }
}

/// Runtime replaying a fixed thread table
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    pub threads: Vec<ScriptedThread>,
    pub own_tid: u32,
    pub cpu_supported: bool,
    pub stack_requests: AtomicUsize,
    /// Threads whose CPU time reads as unsupported from now on
    pub cpu_withheld: Mutex<HashSet<u32>>,
}

impl ScriptedRuntime {
    pub fn new(threads: Vec<ScriptedThread>) -> Self {
        Self {
            threads,
            own_tid: 0,
            cpu_supported: true,
            stack_requests: AtomicUsize::new(0),
            cpu_withheld: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_own_tid(mut self, tid: u32) -> Self {
        self.own_tid = tid;
        self
    }

    fn find(&self, thread: &ThreadHandle) -> Option<&ScriptedThread> {
        self.threads.iter().find(|t| t.handle.tid == thread.tid)
    }

    pub fn withhold_cpu_time(&self, tid: u32) {
        self.cpu_withheld.lock().unwrap().insert(tid);
    }

    pub fn stack_requests(&self) -> usize {
        self.stack_requests.load(Ordering::Relaxed)
    }
}

impl ThreadInspector for ScriptedRuntime {
    fn live_threads(&self) -> Vec<ThreadHandle> {
        self.threads.iter().map(|t| t.handle.clone()).collect()
    }

    fn state(&self, thread: &ThreadHandle) -> Option<ThreadState> {
        self.find(thread).and_then(|t| t.state)
    }

    fn stack_trace(&self, thread: &ThreadHandle) -> Option<StackSnapshot> {
        self.stack_requests.fetch_add(1, Ordering::Relaxed);
        let scripted = self.find(thread)?;
        Some(
            scripted
                .frames
                .iter()
                .map(|(scope, op)| StackFrame::new(scope.as_str(), op.as_str()))
                .collect(),
        )
    }

    fn current_thread_id(&self) -> u32 {
        self.own_tid
    }
}

impl CpuTimeReader for ScriptedRuntime {
    fn cpu_time_supported(&self) -> bool {
        self.cpu_supported
    }

    fn cpu_time_nanos(&self, thread: &ThreadHandle) -> Option<u64> {
        if self.cpu_withheld.lock().unwrap().contains(&thread.tid) {
            return None;
        }
        self.find(thread).and_then(|t| t.cpu_nanos)
    }
}

/// Properties monitoring `prefixes`, with a short window for fast tests
pub fn properties(prefixes: &[&str], groups: &[&str]) -> AgentProperties {
    AgentProperties {
        filter_method_names: prefixes.iter().map(|s| s.to_string()).collect(),
        grouping_method_names: groups.iter().map(|s| s.to_string()).collect(),
        sampling_window_ms: 100,
        probe_interval_ms: 10,
        listen_address: "127.0.0.1:0".to_string(),
        ..AgentProperties::default()
    }
}

/// Values by key, for comparisons across cycles
pub fn values(registry: &cpu_time_exporter::registry::MetricRegistry) -> HashMap<String, f64> {
    registry
        .snapshot()
        .into_iter()
        .map(|entry| (entry.key.as_str().to_string(), entry.seconds))
        .collect()
}
