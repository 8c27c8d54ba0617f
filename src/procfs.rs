//! Linux runtime backed by `/proc/self/task`
//!
//! - Enumeration: one directory per thread id under `/proc/self/task`
//! - State: third field of `task/<tid>/stat`
//! - CPU time: `task/<tid>/schedstat` (nanoseconds on CPU), falling back to
//!   `utime + stime` clock ticks from `stat`
//! - Stacks: [`StackCapturer`] (signal-driven self-unwinding)
//!
//! Every read tolerates the thread disappearing between enumeration and
//! inspection: missing files map to `None`, never to an error.

use crate::runtime::{CpuTimeReader, StackSnapshot, ThreadHandle, ThreadInspector, ThreadState};
use crate::stack_capture::{CaptureError, StackCapturer};
use nix::unistd::gettid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Task directory of the current process
pub const SELF_TASK_DIR: &str = "/proc/self/task";

/// Fields of `/proc/<pid>/task/<tid>/stat` the runtime needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStat {
    pub state: char,
    /// User-mode CPU time in clock ticks
    pub utime: u64,
    /// Kernel-mode CPU time in clock ticks
    pub stime: u64,
}

/// Parse a `stat` line
///
/// The command name is parenthesised and may contain spaces or parentheses,
/// so fields are counted from the last `)`.
pub fn parse_stat(contents: &str) -> Option<TaskStat> {
    let (_, rest) = contents.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); utime is field 14, stime field 15
    let state = fields.first()?.chars().next()?;
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    Some(TaskStat {
        state,
        utime,
        stime,
    })
}

/// Parse the on-CPU nanoseconds from a `schedstat` line
pub fn parse_schedstat(contents: &str) -> Option<u64> {
    contents.split_whitespace().next()?.parse().ok()
}

/// Thread inspection and CPU time for the current process
#[derive(Debug)]
pub struct ProcfsRuntime {
    task_dir: PathBuf,
    capturer: Option<StackCapturer>,
    nanos_per_tick: u64,
}

impl ProcfsRuntime {
    /// Runtime for this process, with stack capture installed
    pub fn new() -> Result<Self, CaptureError> {
        let capturer = StackCapturer::install()?;
        Ok(Self {
            capturer: Some(capturer),
            ..Self::without_stacks()
        })
    }

    /// Runtime that reports threads, states and CPU time but no stacks
    pub fn without_stacks() -> Self {
        Self::with_task_dir(SELF_TASK_DIR)
    }

    /// Runtime reading an arbitrary task directory (no stack capture)
    pub fn with_task_dir<P: AsRef<Path>>(task_dir: P) -> Self {
        Self {
            task_dir: task_dir.as_ref().to_path_buf(),
            capturer: None,
            nanos_per_tick: nanos_per_clock_tick(),
        }
    }

    fn read_task_file(&self, tid: u32, file: &str) -> Option<String> {
        fs::read_to_string(self.task_dir.join(tid.to_string()).join(file)).ok()
    }

    fn task_stat(&self, tid: u32) -> Option<TaskStat> {
        parse_stat(&self.read_task_file(tid, "stat")?)
    }
}

fn nanos_per_clock_tick() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        1_000_000_000 / ticks as u64
    } else {
        10_000_000
    }
}

impl ThreadInspector for ProcfsRuntime {
    fn live_threads(&self) -> Vec<ThreadHandle> {
        let Ok(entries) = fs::read_dir(&self.task_dir) else {
            return Vec::new();
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .map(|tid| {
                let name = self
                    .read_task_file(tid, "comm")
                    .map(|comm| comm.trim().to_string())
                    .filter(|comm| !comm.is_empty())
                    .unwrap_or_else(|| "<unnamed>".to_string());
                ThreadHandle::new(tid, name)
            })
            .collect()
    }

    fn state(&self, thread: &ThreadHandle) -> Option<ThreadState> {
        self.task_stat(thread.tid)
            .map(|stat| ThreadState::from_proc_code(stat.state))
    }

    fn stack_trace(&self, thread: &ThreadHandle) -> Option<StackSnapshot> {
        let snapshot = self.capturer.as_ref()?.capture(thread.tid);
        if snapshot.is_none() {
            trace!(thread = %thread, "thread did not answer stack capture");
        }
        snapshot
    }

    fn current_thread_id(&self) -> u32 {
        gettid().as_raw() as u32
    }
}

impl CpuTimeReader for ProcfsRuntime {
    fn cpu_time_supported(&self) -> bool {
        let current = ThreadHandle::new(self.current_thread_id(), "");
        self.cpu_time_nanos(&current).is_some()
    }

    fn cpu_time_nanos(&self, thread: &ThreadHandle) -> Option<u64> {
        if let Some(nanos) = self
            .read_task_file(thread.tid, "schedstat")
            .as_deref()
            .and_then(parse_schedstat)
        {
            return Some(nanos);
        }

        self.task_stat(thread.tid)
            .map(|stat| (stat.utime + stat.stime).saturating_mul(self.nanos_per_tick))
    }
}
