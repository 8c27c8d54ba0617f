//! Signal-driven stack capture against real threads of the test process
//!
//! These tests install the process-wide `SIGPROF` handler, so they run
//! serially.

use cpu_time_exporter::procfs::ProcfsRuntime;
use cpu_time_exporter::runtime::{CpuTimeReader, ThreadHandle, ThreadInspector, ThreadState};
use cpu_time_exporter::stack_capture::StackCapturer;
use serial_test::serial;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[inline(never)]
fn busy_marker(stop: &AtomicBool) -> u64 {
    let mut acc = 0u64;
    while !stop.load(Ordering::Relaxed) {
        acc = black_box(acc.wrapping_mul(31).wrapping_add(7));
    }
    acc
}

#[inline(never)]
fn other_busy_marker(stop: &AtomicBool) -> u64 {
    let mut acc = 1u64;
    while !stop.load(Ordering::Relaxed) {
        acc = black_box(acc.rotate_left(3) ^ 0x5bd1_e995);
    }
    acc
}

/// Thread spinning in `busy_marker` until `stop` is set; returns its tid
fn spawn_busy(stop: Arc<AtomicBool>) -> (u32, thread::JoinHandle<u64>) {
    spawn_spinner(stop, busy_marker)
}

fn spawn_spinner(
    stop: Arc<AtomicBool>,
    spin: fn(&AtomicBool) -> u64,
) -> (u32, thread::JoinHandle<u64>) {
    let tid = Arc::new(AtomicU32::new(0));
    let published = Arc::clone(&tid);
    let handle = thread::Builder::new()
        .name("busy-marker".to_string())
        .spawn(move || {
            published.store(nix::unistd::gettid().as_raw() as u32, Ordering::Release);
            spin(&stop)
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while tid.load(Ordering::Acquire) == 0 && Instant::now() < deadline {
        thread::yield_now();
    }
    (tid.load(Ordering::Acquire), handle)
}

#[test]
#[serial]
fn test_capture_finds_busy_function() {
    let capturer = StackCapturer::install().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tid, handle) = spawn_busy(Arc::clone(&stop));

    let mut found = false;
    for _ in 0..20 {
        if let Some(snapshot) = capturer.capture(tid) {
            if snapshot
                .frames()
                .iter()
                .any(|frame| frame.operation == "busy_marker")
            {
                found = true;
                break;
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    assert!(found, "busy_marker never appeared in a captured stack");
}

#[test]
#[serial]
fn test_captured_stack_has_no_handler_frames() {
    let capturer = StackCapturer::install().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tid, handle) = spawn_busy(Arc::clone(&stop));

    let snapshot = (0..20).find_map(|_| capturer.capture(tid));

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    let snapshot = snapshot.expect("no stack captured");
    assert!(!snapshot.is_empty());
    assert!(snapshot
        .frames()
        .iter()
        .all(|frame| frame.operation != "on_sample_signal"));
}

#[test]
#[serial]
fn test_capture_of_exited_thread_is_none() {
    let capturer = StackCapturer::install().unwrap();
    let stop = Arc::new(AtomicBool::new(true));
    let (tid, handle) = spawn_busy(stop);
    handle.join().unwrap();

    // Give the kernel a moment to reap the task
    thread::sleep(Duration::from_millis(20));
    assert!(capturer.capture(tid).is_none());
}

#[test]
#[serial]
fn test_procfs_runtime_reports_busy_thread() {
    let runtime = ProcfsRuntime::new().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (tid, handle) = spawn_busy(Arc::clone(&stop));
    let busy = ThreadHandle::new(tid, "busy-marker");

    let listed = runtime
        .live_threads()
        .into_iter()
        .find(|thread| thread.tid == tid);

    // Spinning threads are runnable; allow for a preemption or two
    let runnable = (0..50).any(|_| {
        let state = runtime.state(&busy);
        thread::sleep(Duration::from_millis(1));
        state == Some(ThreadState::Runnable)
    });

    thread::sleep(Duration::from_millis(50));
    let cpu = runtime.cpu_time_nanos(&busy);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    assert_eq!(listed.map(|t| t.name), Some("busy-marker".to_string()));
    assert!(runnable);
    assert!(cpu.unwrap_or(0) > 0);
}

#[test]
#[serial]
fn test_concurrent_capturers_lose_no_captures() {
    let stop = Arc::new(AtomicBool::new(false));
    let (first_tid, first) = spawn_spinner(Arc::clone(&stop), busy_marker);
    let (second_tid, second) = spawn_spinner(Arc::clone(&stop), other_busy_marker);

    // Each capturer repeatedly unwinds its own target; returns (misses, foreign)
    let run = |tid: u32, foreign: &'static str| {
        thread::spawn(move || {
            let capturer = StackCapturer::install().unwrap();
            let mut misses = 0;
            let mut wrong = 0;
            for _ in 0..200 {
                match capturer.capture(tid) {
                    None => misses += 1,
                    Some(snapshot) => {
                        if snapshot.frames().iter().any(|f| f.operation == foreign) {
                            wrong += 1;
                        }
                    }
                }
            }
            (misses, wrong)
        })
    };

    let a = run(first_tid, "other_busy_marker");
    let b = run(second_tid, "busy_marker");
    let (a_misses, a_wrong) = a.join().unwrap();
    let (b_misses, b_wrong) = b.join().unwrap();

    stop.store(true, Ordering::Relaxed);
    first.join().unwrap();
    second.join().unwrap();

    assert_eq!(a_misses + b_misses, 0, "captures lost while two capturers ran");
    assert_eq!(a_wrong + b_wrong, 0, "stack attributed to the wrong thread");
}
