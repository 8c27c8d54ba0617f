//! Runtime interfaces the sampling engine observes threads through
//!
//! The engine never creates or destroys threads. It only asks the host runtime
//! which threads exist, what state they are in, what their stacks look like and
//! how much CPU time they have consumed. Keeping these behind traits lets the
//! sampler and attributor run against a scripted runtime in tests and against
//! `/proc/self/task` in production (see [`crate::procfs`]).

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a schedulable thread in the host process
///
/// Equality and hashing use the kernel thread id only. The name is carried
/// for logging; a thread may rename itself between probes.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    /// Kernel thread id (`gettid()`)
    pub tid: u32,
    /// Thread name as reported by the runtime (`comm` on Linux)
    pub name: String,
}

impl ThreadHandle {
    pub fn new(tid: u32, name: impl Into<String>) -> Self {
        Self {
            tid,
            name: name.into(),
        }
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.tid == other.tid
    }
}

impl Eq for ThreadHandle {}

impl Hash for ThreadHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tid.hash(state);
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.tid)
    }
}

/// Run state of a thread at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Running on a CPU or ready to run
    Runnable,
    /// Sleeping, parked or stopped
    Waiting,
    /// In uninterruptible wait (usually I/O)
    Blocked,
    /// Exited but not yet reaped
    Terminated,
}

impl ThreadState {
    /// Map a Linux `/proc/<pid>/task/<tid>/stat` state letter
    pub fn from_proc_code(code: char) -> Self {
        match code {
            'R' => ThreadState::Runnable,
            'D' => ThreadState::Blocked,
            'Z' | 'X' | 'x' => ThreadState::Terminated,
            _ => ThreadState::Waiting,
        }
    }

    pub fn is_runnable(self) -> bool {
        self == ThreadState::Runnable
    }
}

/// A single stack frame: the defining scope and the operation name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    /// Defining scope, e.g. `app.worker` or `com.example.MyClass`
    pub scope: String,
    /// Operation (function) name
    pub operation: String,
}

impl StackFrame {
    pub fn new(scope: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            operation: operation.into(),
        }
    }

    /// `scope.operation`, or just the operation for scope-less symbols
    pub fn qualified_name(&self) -> String {
        if self.scope.is_empty() {
            self.operation.clone()
        } else {
            format!("{}.{}", self.scope, self.operation)
        }
    }
}

/// Frames of one thread captured at one instant, innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSnapshot {
    frames: Vec<StackFrame>,
}

impl StackSnapshot {
    pub fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl FromIterator<StackFrame> for StackSnapshot {
    fn from_iter<I: IntoIterator<Item = StackFrame>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Thread enumeration, state and stack access
pub trait ThreadInspector: Send + Sync {
    /// All threads currently alive in the process
    fn live_threads(&self) -> Vec<ThreadHandle>;

    /// Current state, or `None` if the thread has gone away
    fn state(&self, thread: &ThreadHandle) -> Option<ThreadState>;

    /// Current stack, or `None` if the thread vanished or did not respond
    fn stack_trace(&self, thread: &ThreadHandle) -> Option<StackSnapshot>;

    /// Kernel thread id of the calling thread
    fn current_thread_id(&self) -> u32;
}

/// Per-thread CPU time
pub trait CpuTimeReader: Send + Sync {
    /// Whether this runtime can report per-thread CPU time at all
    fn cpu_time_supported(&self) -> bool;

    /// CPU time consumed since thread start in nanoseconds.
    ///
    /// `None` is the "unsupported" sentinel for this thread on this read.
    fn cpu_time_nanos(&self, thread: &ThreadHandle) -> Option<u64>;
}
