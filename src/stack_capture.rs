//! Stack capture for other threads of this process via `SIGPROF`
//!
//! A thread cannot be unwound from the outside without stopping it, so the
//! sampler asks the thread to unwind itself: it sends `SIGPROF` with
//! `tgkill(2)` and the handler, running on the target thread, walks its own
//! stack with `backtrace::trace_unsynchronized` into a static slot of atomic
//! instruction pointers. The sampler waits for the completion token, copies
//! the addresses out and symbolizes them on its own thread.
//!
//! # Handler constraints
//!
//! The handler only touches atomics and the unwinder; no allocation, no locks.
//! Symbol resolution (which allocates) never runs in signal context.
//!
//! # Note
//!
//! Only one capture is in flight per process, across all capturers. A handler
//! claims the slot before writing it and releases it when done, so a handler
//! that runs late either finds its request withdrawn and returns, or keeps the
//! slot until it finishes and the next request waits.

use crate::runtime::{StackFrame, StackSnapshot};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{getpid, gettid};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of frames captured per stack
pub const MAX_STACK_DEPTH: usize = 128;

/// How long the sampler waits for a thread to unwind itself
pub const CAPTURE_TIMEOUT: Duration = Duration::from_millis(20);

/// Resolved symbols kept before the cache is reset
const SYMBOL_CACHE_LIMIT: usize = 64 * 1024;

/// Frames above the signal trampoline are searched only this deep
const HANDLER_FRAME_SEARCH: usize = 16;

/// Errors while setting up stack capture
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to install SIGPROF handler: {0}")]
    SignalInstall(#[from] nix::Error),
}

/// Set on `request` while a handler is writing the slot
const CLAIMED: u64 = 1 << 63;

/// Sequence numbers stay below the claim bit
const SEQUENCE_MASK: u32 = 0x7fff_ffff;

/// Shared between the requesting sampler and the signal handler
///
/// `request` moves `0 → token → token|CLAIMED → 0`. The sampler may only post
/// into an idle slot and may only withdraw an unclaimed token; a handler may
/// only write `ips` and `depth` between its claim and its release.
struct CaptureSlot {
    /// `(sequence << 32) | tid` of the pending request, 0 when idle
    request: AtomicU64,
    /// Token of the last request a handler finished
    completed: AtomicU64,
    depth: AtomicUsize,
    ips: [AtomicUsize; MAX_STACK_DEPTH],
}

impl CaptureSlot {
    const fn new() -> Self {
        Self {
            request: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            ips: [const { AtomicUsize::new(0) }; MAX_STACK_DEPTH],
        }
    }

    fn token(sequence: u32, tid: u32) -> u64 {
        (u64::from(sequence & SEQUENCE_MASK) << 32) | u64::from(tid)
    }

    /// Publish a request; fails while the slot is pending or claimed
    fn post(&self, token: u64) -> bool {
        self.request
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Handler side: take the pending request addressed to `tid`
    fn claim(&self, tid: u32) -> Option<u64> {
        let request = self.request.load(Ordering::Acquire);
        if request == 0 || request & CLAIMED != 0 || request as u32 != tid {
            return None;
        }
        self.request
            .compare_exchange(
                request,
                request | CLAIMED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| request)
    }

    fn store_ip(&self, index: usize, ip: usize) {
        self.ips[index].store(ip, Ordering::Relaxed);
    }

    /// Handler side: publish the depth and release the slot
    fn finish(&self, token: u64, depth: usize) {
        self.depth.store(depth, Ordering::Relaxed);
        self.completed.store(token, Ordering::Release);
        self.request.store(0, Ordering::Release);
    }

    /// Sampler side: the captured addresses once the handler for `token` finished
    fn take(&self, token: u64) -> Option<Vec<usize>> {
        if self.completed.load(Ordering::Acquire) != token {
            return None;
        }
        let depth = self.depth.load(Ordering::Relaxed).min(MAX_STACK_DEPTH);
        Some(
            self.ips[..depth]
                .iter()
                .map(|ip| ip.load(Ordering::Relaxed))
                .collect(),
        )
    }

    /// Sampler side: cancel an unanswered request; false once a handler claimed it
    fn withdraw(&self, token: u64) -> bool {
        self.request
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

static SLOT: CaptureSlot = CaptureSlot::new();

/// Serialises captures across every capturer in the process; holds the sequence
static CAPTURE_LOCK: Mutex<u32> = Mutex::new(0);

static HANDLER_INSTALLED: OnceLock<Result<(), nix::Error>> = OnceLock::new();

extern "C" fn on_sample_signal(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    let Some(token) = SLOT.claim(gettid().as_raw() as u32) else {
        return;
    };

    // SAFETY: errno is thread-local; restore it so the interrupted code never
    // observes a value written by the unwinder.
    let saved_errno = unsafe { *libc::__errno_location() };

    let mut depth = 0usize;
    // SAFETY: trace_unsynchronized must not run concurrently with another
    // unsynchronized trace on this thread; the handler does not nest because
    // SIGPROF is blocked while it runs.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if depth >= MAX_STACK_DEPTH {
                return false;
            }
            SLOT.store_ip(depth, frame.ip() as usize);
            depth += 1;
            true
        });
    }

    SLOT.finish(token, depth);

    unsafe { *libc::__errno_location() = saved_errno };
}

fn install_handler() -> Result<(), CaptureError> {
    let installed = HANDLER_INSTALLED.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::SigAction(on_sample_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only uses async-signal-safe operations on atomics
        // and the unwinder.
        let previous = unsafe { sigaction(Signal::SIGPROF, &action) }?;
        if !matches!(previous.handler(), SigHandler::SigDfl | SigHandler::SigIgn) {
            warn!("replaced an existing SIGPROF handler");
        }
        debug!("SIGPROF stack capture handler installed");
        Ok(())
    });
    (*installed).map_err(CaptureError::from)
}

/// Captures and symbolizes stacks of threads in this process
pub struct StackCapturer {
    pid: i32,
    symbols: Mutex<Symbolizer>,
}

impl StackCapturer {
    /// Install the `SIGPROF` handler (once per process) and create a capturer
    pub fn install() -> Result<Self, CaptureError> {
        install_handler()?;
        Ok(Self {
            pid: getpid().as_raw(),
            symbols: Mutex::new(Symbolizer::default()),
        })
    }

    /// Raw instruction pointers of `tid`, innermost first
    ///
    /// `None` if the thread no longer exists, did not answer within
    /// [`CAPTURE_TIMEOUT`], or a late handler from an earlier request still
    /// holds the slot.
    pub fn capture_ips(&self, tid: u32) -> Option<Vec<usize>> {
        let mut sequence = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence = sequence.wrapping_add(1) & SEQUENCE_MASK;
        if *sequence == 0 {
            *sequence = 1;
        }
        let token = CaptureSlot::token(*sequence, tid);
        let deadline = Instant::now() + CAPTURE_TIMEOUT;

        while !SLOT.post(token) {
            if Instant::now() >= deadline {
                debug!(tid, "capture slot still held by a late handler");
                return None;
            }
            thread::yield_now();
        }

        // SAFETY: tgkill only targets a thread of our own thread group.
        let sent = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::c_long::from(self.pid),
                tid as libc::c_long,
                libc::c_long::from(libc::SIGPROF),
            )
        };
        if sent != 0 {
            SLOT.withdraw(token);
            return None;
        }

        loop {
            if let Some(ips) = SLOT.take(token) {
                return Some(ips);
            }
            if Instant::now() >= deadline {
                // A handler that claimed the request keeps the slot until it
                // finishes; the next capture waits for that release.
                if SLOT.withdraw(token) {
                    return None;
                }
                return SLOT.take(token);
            }
            thread::yield_now();
        }
    }

    /// Symbolized stack of `tid` with the capture machinery removed
    pub fn capture(&self, tid: u32) -> Option<StackSnapshot> {
        let ips = self.capture_ips(tid)?;
        let mut symbols = self.symbols.lock().unwrap_or_else(PoisonError::into_inner);
        let frames = ips.into_iter().map(|ip| symbols.frame_for(ip)).collect();
        Some(StackSnapshot::new(strip_signal_frames(frames)))
    }
}

impl std::fmt::Debug for StackCapturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCapturer").field("pid", &self.pid).finish()
    }
}

/// Memoised instruction pointer → frame resolution
#[derive(Debug, Default)]
struct Symbolizer {
    cache: HashMap<usize, StackFrame>,
}

impl Symbolizer {
    fn frame_for(&mut self, ip: usize) -> StackFrame {
        if self.cache.len() >= SYMBOL_CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.entry(ip).or_insert_with(|| resolve_ip(ip)).clone()
    }
}

fn resolve_ip(ip: usize) -> StackFrame {
    let mut name = None;
    backtrace::resolve(ip as *mut c_void, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| format!("{n:#}"));
        }
    });

    match name {
        Some(name) => split_symbol(&name),
        None => StackFrame::new("<unknown>", format!("{ip:#x}")),
    }
}

/// Split a demangled path into scope and operation
///
/// The split happens at the last `::` outside generic brackets; the scope's
/// remaining `::` separators become `.`:
///
/// ```
/// use cpu_time_exporter::stack_capture::split_symbol;
///
/// let frame = split_symbol("app::worker::process");
/// assert_eq!(frame.scope, "app.worker");
/// assert_eq!(frame.operation, "process");
/// ```
pub fn split_symbol(symbol: &str) -> StackFrame {
    let bytes = symbol.as_bytes();
    let mut depth = 0i32;
    let mut split = None;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            // `->` in fn pointer types does not close a bracket
            b'>' if i == 0 || bytes[i - 1] != b'-' => depth -= 1,
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split = Some(i);
                i += 2;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    match split {
        Some(at) => StackFrame::new(symbol[..at].replace("::", "."), &symbol[at + 2..]),
        None => StackFrame::new("", symbol),
    }
}

fn is_signal_trampoline(frame: &StackFrame) -> bool {
    frame.scope.is_empty()
        && matches!(
            frame.operation.as_str(),
            "__restore_rt" | "__kernel_rt_sigreturn" | "_sigtramp"
        )
}

fn is_capture_machinery(frame: &StackFrame) -> bool {
    frame.scope.starts_with("backtrace")
        || frame.operation == "on_sample_signal"
        || frame.operation.starts_with("_Unwind_")
}

/// Drop the handler and unwinder frames above the interrupted code
fn strip_signal_frames(frames: Vec<StackFrame>) -> Vec<StackFrame> {
    let trampoline = frames
        .iter()
        .take(HANDLER_FRAME_SEARCH)
        .position(is_signal_trampoline);

    let skip = match trampoline {
        Some(pos) => pos + 1,
        None => frames
            .iter()
            .take_while(|frame| is_capture_machinery(frame))
            .count(),
    };
    frames.into_iter().skip(skip).collect()
}
