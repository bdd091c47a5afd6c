//! Worker (slave) runtime: replays an index range in-process and turns
//! fatal failures into framed messages for the master.
//!
//! # Crash path
//!
//! The last-resort handler hooks the fatal signals (segfault, bus error,
//! illegal instruction, FP exception, abort). It runs on whatever thread
//! faulted and is restricted to: writing framed bytes to the private
//! crash fd, reading the engine's crash-visible atomics, and calling the
//! engine's emergency teardown. `CRASH` goes out first so the master
//! arms its timeout before the possibly-slow teardown starts; then the
//! implicated modules, then the two progress markers; then `_exit(2)`.
//!
//! The crash fd is a private duplicate of the original stdout, taken
//! before stdout is re-pointed at `/dev/null`, so nothing the driver
//! prints can corrupt the framed channel.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::archive::ArchiveSet;
use crate::control::ControlBlock;
use crate::engine::{
    emergency_teardown, CrashVisible, EngineOptions, FaultPlan, PipelineRanges, ReplayerEngine,
    MAX_IMPLICATED_MODULES,
};
use crate::hasher::Hash;
use crate::ipc::{send_message, Message};
use crate::state::document;

use super::EXIT_CRASH_HANDLER;

/// Everything a worker needs, parsed off its command line.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub archives: Vec<PathBuf>,
    pub ranges: PipelineRanges,
    pub shm_name: Option<String>,
    pub shm_mutex_name: Option<String>,
    pub engine: EngineOptions,
}

// ============================================================================
// Crash handler state
// ============================================================================

static CRASH_FD: AtomicI32 = AtomicI32::new(-1);
static CRASH_VIS: AtomicPtr<CrashVisible> = AtomicPtr::new(std::ptr::null_mut());

const FATAL_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

extern "C" fn on_fatal_signal(_signo: libc::c_int) {
    let fd = CRASH_FD.load(Ordering::Acquire);
    if fd < 0 {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
    }

    // CRASH first: the master arms its timeout on receipt, covering
    // everything below, including a wedged teardown.
    if !send_message(fd, &Message::Crash) {
        unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
    }

    let vis = CRASH_VIS.load(Ordering::Acquire);
    if !vis.is_null() {
        // SAFETY: the pointer was published from a leaked Arc and stays
        // valid for the remaining life of the process.
        let vis = unsafe { &*vis };

        let mut modules = [0 as Hash; MAX_IMPLICATED_MODULES];
        let count = vis.implicated_modules(&mut modules);
        for &module in modules.iter().take(count) {
            if !send_message(fd, &Message::Module(module)) {
                unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
            }
        }

        let graphics = vis.current_graphics_index.load(Ordering::Relaxed);
        let compute = vis.current_compute_index.load(Ordering::Relaxed);
        if !send_message(fd, &Message::Graphics(graphics)) {
            unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
        }
        if !send_message(fd, &Message::Compute(compute)) {
            unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
        }

        // Give driver cache-writer threads a chance to finish. May never
        // return; the master's timeout covers that.
        emergency_teardown(vis);
    }

    unsafe { libc::_exit(EXIT_CRASH_HANDLER) }
}

fn install_crash_handler(fd: libc::c_int) {
    CRASH_FD.store(fd, Ordering::Release);
    // SAFETY: installing a handler that only performs async-signal-safe
    // operations; the zeroed sigaction is fully initialized below.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_fatal_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        sa.sa_flags = 0;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in FATAL_SIGNALS {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

fn publish_crash_state(vis: Arc<CrashVisible>) {
    // Leaked intentionally: the handler may fire at any point until
    // process exit, so the pointee must never be freed.
    CRASH_VIS.store(Arc::into_raw(vis).cast_mut(), Ordering::Release);
}

fn disarm_crash_handler() {
    // Teardown crashes would re-enter a handler pointing at state that
    // is going away; fall back to default disposition instead.
    // SAFETY: resetting dispositions to SIG_DFL.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in FATAL_SIGNALS {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
    CRASH_VIS.store(std::ptr::null_mut(), Ordering::Release);
    CRASH_FD.store(-1, Ordering::Release);
}

// ============================================================================
// Runtime
// ============================================================================

/// Reads blacklisted module hashes from stdin: one hex line each,
/// terminated by EOF or a line that parses to zero.
fn read_blacklist(engine: &mut ReplayerEngine) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let hash = u64::from_str_radix(line.trim(), 16).unwrap_or(0);
        if hash == 0 {
            break;
        }
        engine.mask_shader_module(hash);
    }
}

/// Duplicates stdout into a private crash fd and re-points fd 1 at
/// `/dev/null`. Returns the crash fd, or a negative value on failure.
fn steal_stdout() -> libc::c_int {
    // SAFETY: plain fd plumbing on our own descriptors.
    unsafe {
        let crash_fd = libc::dup(1);
        if crash_fd < 0 {
            return crash_fd;
        }
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if devnull >= 0 {
            libc::dup2(devnull, 1);
            libc::close(devnull);
        }
        crash_fd
    }
}

/// Runs the worker to completion, returning its exit code.
pub fn run_worker(config: WorkerConfig) -> i32 {
    // Telemetry is optional: a corrupt or missing control block must not
    // stop replay.
    let _control = match (&config.shm_name, &config.shm_mutex_name) {
        (Some(shm), Some(mutex)) => match ControlBlock::attach(shm, mutex) {
            Ok(block) => Some(block),
            Err(err) => {
                eprintln!("replayer-rs: worker continuing without control block: {err}");
                None
            }
        },
        _ => None,
    };

    let fault = FaultPlan::from_env();
    let crash_early = fault.crash_early;
    let mut engine = ReplayerEngine::new(config.engine.clone(), config.ranges.clone(), fault);

    read_blacklist(&mut engine);

    let crash_fd = steal_stdout();
    if crash_fd < 0 {
        eprintln!("replayer-rs: failed to duplicate stdout for crash channel");
        return 1;
    }
    install_crash_handler(crash_fd);

    if crash_early {
        // Models a driver that dies during instance bring-up: the crash
        // handler fires before any progress state exists.
        std::process::abort();
    }

    publish_crash_state(engine.crash_visible());

    let docs = match ArchiveSet::new(config.archives.clone()).load() {
        Ok(docs) => docs,
        Err(err) => {
            eprintln!("replayer-rs: worker failed to load archives: {err}");
            return 1;
        }
    };

    for doc in &docs {
        if let Err(err) = document::replay(doc, &mut engine) {
            eprintln!("replayer-rs: worker replay failed: {err}");
            return 1;
        }
        engine.finish_document();
    }

    disarm_crash_handler();

    let stats = engine.stats();
    eprintln!(
        "worker done: graphics_built={} compute_built={} skipped_blacklisted={} masked={}",
        stats.graphics_built,
        stats.compute_built,
        stats.skipped_blacklisted,
        engine.masked_module_count(),
    );
    0
}
