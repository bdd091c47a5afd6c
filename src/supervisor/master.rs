//! Master supervisor: work partitioning, worker spawning, and the
//! poll-based recovery loop.
//!
//! # Event model
//!
//! Three waitable fds exist per live worker:
//!
//! - the framed message channel (readable when a message arrived),
//! - a process fd (readable when the worker exited),
//! - a one-shot crash timer, armed only after a `CRASH` message.
//!
//! One `poll` covers all of them. The poll array enlists each worker's
//! channel fd *before* its process fd, and only the first ready entry is
//! handled per iteration, so every message a dying worker managed to
//! send is consumed before its exit is acted on. That ordering is what
//! guarantees a crashing worker's `MODULE` reports make it into the
//! blacklist its replacement receives.
//!
//! # Recovery policy
//!
//! A worker that exits zero retires its range. A nonzero exit with both
//! progress markers observed respawns the slot over the unfinished
//! sub-range with the enlarged blacklist, provided the respawn can make
//! progress (the range start advanced, or the blacklist grew); anything
//! else is an unrecoverable crash and the range is dropped. Workers that
//! hang in crash teardown are killed one second after their `CRASH`
//! message and handled like any other crash.
//!
//! All worker state lives on the supervising thread; nothing here needs
//! a lock.

use std::io::{self, Write};
use std::ops::Range;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use ahash::AHashSet;

use crate::archive::ArchiveSet;
use crate::control::ControlBlock;
use crate::engine::EngineOptions;
use crate::errors::SupervisorError;
use crate::hasher::Hash;
use crate::ipc::{self, Message, RecvOutcome, MAX_MESSAGE_LEN};

use super::EXIT_TIMEOUT_TERMINATED;

/// Ring size used when this process creates the telemetry block.
const TELEMETRY_RING_SIZE: u32 = 4096;

/// How long a crashing worker gets to finish its teardown.
const CRASH_TIMEOUT_SECS: u64 = 1;

/// Master-side configuration, parsed off the command line.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    pub archives: Vec<PathBuf>,
    pub worker_count: u32,
    pub quiet_slave: bool,
    pub shm_name: Option<String>,
    pub shm_mutex_name: Option<String>,
    /// Create and serve the telemetry block instead of attaching to one
    /// owned by an external observer.
    pub shm_create: bool,
    pub engine: EngineOptions,
    /// Worker executable; defaults to the running binary.
    pub worker_exe: Option<PathBuf>,
}

/// Outcome summary for the whole run.
#[derive(Clone, Copy, Debug, Default)]
pub struct MasterReport {
    pub clean_exits: u32,
    pub respawns: u32,
    pub dropped_slots: u32,
    pub banned_modules: usize,
}

/// Splits `[0, total)` into `workers` contiguous half-open pieces.
pub fn partition(total: u32, workers: u32, slot: u32) -> Range<u32> {
    let start = (u64::from(slot) * u64::from(total) / u64::from(workers)) as u32;
    let end = (u64::from(slot + 1) * u64::from(total) / u64::from(workers)) as u32;
    start..end
}

/// Per-slot worker lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Running,
    Crashing,
    Terminated,
    Retired,
}

struct WorkerSlot {
    index: u32,
    graphics: Range<u32>,
    compute: Range<u32>,
    state: WorkerState,
    child: Option<Child>,
    pidfd: Option<OwnedFd>,
    pipe: Option<OwnedFd>,
    timer: Option<OwnedFd>,
    /// Last progress markers; -1 until the first marker arrives.
    graphics_progress: i64,
    compute_progress: i64,
    /// Blacklist size when this incarnation spawned; used to decide
    /// whether a respawn can make progress.
    blacklist_at_spawn: usize,
}

impl WorkerSlot {
    fn new(index: u32, graphics: Range<u32>, compute: Range<u32>) -> Self {
        Self {
            index,
            graphics,
            compute,
            state: WorkerState::Retired,
            child: None,
            pidfd: None,
            pipe: None,
            timer: None,
            graphics_progress: -1,
            compute_progress: -1,
            blacklist_at_spawn: 0,
        }
    }

    fn live(&self) -> bool {
        self.child.is_some()
    }
}

fn pidfd_open(pid: u32) -> io::Result<OwnedFd> {
    // SAFETY: pidfd_open returns a fresh fd we immediately own.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn one_shot_timer(secs: u64) -> io::Result<OwnedFd> {
    // SAFETY: timerfd_create returns a fresh fd; settime takes valid
    // pointers to a fully initialized itimerspec.
    unsafe {
        let fd = libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(fd);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: 0,
            },
        };
        if libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

/// The supervisor. Single-threaded; owns every per-worker resource.
struct Master {
    config: MasterConfig,
    exe: PathBuf,
    slots: Vec<WorkerSlot>,
    blacklist: AHashSet<Hash>,
    control: Option<ControlBlock>,
    report: MasterReport,
}

#[derive(Clone, Copy, Debug)]
enum EventKind {
    Pipe,
    Process,
    Timer,
}

impl Master {
    fn spawn_worker(&mut self, slot_index: usize) -> Result<(), SupervisorError> {
        let slot = &mut self.slots[slot_index];
        slot.graphics_progress = -1;
        slot.compute_progress = -1;
        slot.blacklist_at_spawn = self.blacklist.len();

        let channel = ipc::message_channel().map_err(|source| SupervisorError::SpawnFailure {
            slot: slot.index,
            source,
        })?;

        let mut cmd = Command::new(&self.exe);
        for path in &self.config.archives {
            cmd.arg(path);
        }
        cmd.arg("--slave-process");
        cmd.args(["--num-threads", "1"]);
        cmd.arg("--graphics-pipeline-range")
            .arg(slot.graphics.start.to_string())
            .arg(slot.graphics.end.to_string());
        cmd.arg("--compute-pipeline-range")
            .arg(slot.compute.start.to_string())
            .arg(slot.compute.end.to_string());
        if let Some(name) = &self.config.shm_name {
            cmd.args(["--shm-name", name]);
        }
        if let Some(name) = &self.config.shm_mutex_name {
            cmd.args(["--shm-mutex-name", name]);
        }
        if self.config.engine.pipeline_cache {
            cmd.arg("--pipeline-cache");
        }
        if self.config.engine.spirv_validate {
            cmd.arg("--spirv-val");
        }
        if let Some(path) = &self.config.engine.on_disk_pipeline_cache {
            let mut path = path.as_os_str().to_owned();
            if slot.index != 0 {
                path.push(format!(".{}", slot.index));
            }
            cmd.arg("--on-disk-pipeline-cache").arg(path);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::from(channel.worker));
        if self.config.quiet_slave {
            cmd.stderr(Stdio::null());
        } else {
            cmd.stderr(Stdio::inherit());
        }

        // Lifetime guard: the kernel kills the worker if this process
        // dies, so no orphan keeps holding GPU resources.
        // SAFETY: prctl in the pre-exec child context is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailure {
            slot: slot.index,
            source,
        })?;

        // Stream the blacklist; closing the pipe is the terminator. A
        // write failure means the worker is already dead, which the
        // event loop will pick up.
        if let Some(mut stdin) = child.stdin.take() {
            for hash in &self.blacklist {
                let _ = writeln!(stdin, "{hash:016x}");
            }
        }

        let pidfd = pidfd_open(child.id()).map_err(|source| SupervisorError::SpawnFailure {
            slot: slot.index,
            source,
        })?;

        slot.pipe = Some(channel.master);
        slot.pidfd = Some(pidfd);
        slot.timer = None;
        slot.child = Some(child);
        slot.state = WorkerState::Running;
        Ok(())
    }

    fn control_note_module(&self, message_bytes: &[u8]) {
        if let Some(control) = &self.control {
            control.bump_banned_modules();
            if !control.write_message(message_bytes) {
                eprintln!("replayer-rs: telemetry ring full, dropping module record");
            }
        }
    }

    fn apply_message(&mut self, slot_index: usize, message: Message) {
        match message {
            Message::Crash => {
                let slot = &mut self.slots[slot_index];
                slot.state = WorkerState::Crashing;
                // Re-arming replaces any previous timer.
                match one_shot_timer(CRASH_TIMEOUT_SECS) {
                    Ok(timer) => slot.timer = Some(timer),
                    Err(err) => {
                        eprintln!("replayer-rs: failed to arm crash timer: {err}");
                    }
                }
            }
            Message::Graphics(index) => {
                self.slots[slot_index].graphics_progress = i64::from(index);
            }
            Message::Compute(index) => {
                self.slots[slot_index].compute_progress = i64::from(index);
            }
            Message::Module(hash) => {
                self.blacklist.insert(hash);
                let mut buf = [0u8; MAX_MESSAGE_LEN];
                let len = Message::Module(hash).encode(&mut buf);
                self.control_note_module(&buf[..len]);
            }
        }
    }

    /// Reads one framed message off a worker's channel.
    fn handle_pipe_event(&mut self, slot_index: usize) {
        let Some(pipe) = &self.slots[slot_index].pipe else {
            return;
        };
        let fd = pipe.as_raw_fd();
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        match ipc::recv_message(fd, &mut buf) {
            RecvOutcome::Message(len) => match Message::parse(&buf[..len]) {
                Some(message) => self.apply_message(slot_index, message),
                None => {
                    eprintln!(
                        "replayer-rs: unexpected message from worker {}: {:?}",
                        self.slots[slot_index].index,
                        String::from_utf8_lossy(&buf[..len]),
                    );
                }
            },
            RecvOutcome::WouldBlock => {}
            RecvOutcome::Closed => {
                // Channel failure or normal close; either way the exit
                // path does the accounting.
                self.slots[slot_index].pipe = None;
            }
        }
    }

    /// Drains messages still queued when the worker died.
    fn drain_pipe(&mut self, slot_index: usize) {
        loop {
            let Some(pipe) = &self.slots[slot_index].pipe else {
                return;
            };
            let fd = pipe.as_raw_fd();
            let mut buf = [0u8; MAX_MESSAGE_LEN];
            match ipc::recv_message(fd, &mut buf) {
                RecvOutcome::Message(len) => {
                    if let Some(message) = Message::parse(&buf[..len]) {
                        self.apply_message(slot_index, message);
                    }
                }
                RecvOutcome::WouldBlock | RecvOutcome::Closed => {
                    self.slots[slot_index].pipe = None;
                    return;
                }
            }
        }
    }

    /// Reaps an exited worker and decides between retire and respawn.
    fn handle_process_exit(&mut self, slot_index: usize) -> Result<(), SupervisorError> {
        self.drain_pipe(slot_index);

        let slot = &mut self.slots[slot_index];
        slot.pipe = None;
        slot.timer = None;
        slot.pidfd = None;

        let Some(mut child) = slot.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|source| SupervisorError::WaitFailure { source })?;
        let code = if slot.state == WorkerState::Terminated {
            EXIT_TIMEOUT_TERMINATED
        } else {
            status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
        };

        if code == 0 {
            slot.state = WorkerState::Retired;
            self.report.clean_exits += 1;
            if let Some(control) = &self.control {
                control.bump_clean_process_deaths();
            }
            return Ok(());
        }

        let progress_seen = slot.graphics_progress >= 0 && slot.compute_progress >= 0;
        if !progress_seen {
            eprintln!(
                "replayer-rs: worker {} died (code {code}) before reporting progress; \
                 dropping graphics [{}, {}) and compute [{}, {})",
                slot.index,
                slot.graphics.start,
                slot.graphics.end,
                slot.compute.start,
                slot.compute.end,
            );
            slot.state = WorkerState::Retired;
            self.report.dropped_slots += 1;
            if let Some(control) = &self.control {
                control.bump_dirty_process_deaths();
            }
            return Ok(());
        }

        // Crash with progress: the handler did its job.
        self.report.clean_exits += 1;
        if let Some(control) = &self.control {
            control.bump_clean_process_deaths();
        }

        let new_graphics = slot.graphics_progress as u32;
        let new_compute = slot.compute_progress as u32;
        let advanced = new_graphics > slot.graphics.start || new_compute > slot.compute.start;
        slot.graphics.start = new_graphics.max(slot.graphics.start);
        slot.compute.start = new_compute.max(slot.compute.start);

        if slot.graphics.start >= slot.graphics.end && slot.compute.start >= slot.compute.end {
            eprintln!(
                "replayer-rs: worker {} crashed with nothing left to replay",
                slot.index
            );
            slot.state = WorkerState::Retired;
            return Ok(());
        }

        // Without forward motion or new blacklist entries a respawn
        // would crash at the same pipeline forever.
        if !advanced && self.blacklist.len() == slot.blacklist_at_spawn {
            eprintln!(
                "replayer-rs: worker {} crashed (code {code}) with no way forward; \
                 dropping graphics [{}, {}) and compute [{}, {})",
                slot.index,
                slot.graphics.start,
                slot.graphics.end,
                slot.compute.start,
                slot.compute.end,
            );
            slot.state = WorkerState::Retired;
            self.report.dropped_slots += 1;
            return Ok(());
        }

        eprintln!(
            "replayer-rs: worker {} crashed (code {code}); retrying graphics [{}, {}) \
             and compute [{}, {}) with {} masked modules",
            slot.index,
            slot.graphics.start,
            slot.graphics.end,
            slot.compute.start,
            slot.compute.end,
            self.blacklist.len(),
        );
        self.report.respawns += 1;
        self.spawn_worker(slot_index)
    }

    /// The crash handler overran its timeout; put the worker down.
    fn handle_timer_expiry(&mut self, slot_index: usize) -> Result<(), SupervisorError> {
        let slot = &mut self.slots[slot_index];
        slot.timer = None;
        let Some(pid) = slot.child.as_ref().map(Child::id) else {
            return Ok(());
        };
        eprintln!(
            "replayer-rs: worker {} stuck in crash teardown, terminating",
            slot.index
        );
        slot.state = WorkerState::Terminated;
        // SAFETY: signaling a pid we own; the subsequent wait reaps it.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        self.handle_process_exit(slot_index)
    }

    fn run(&mut self) -> Result<(), SupervisorError> {
        while self.slots.iter().any(WorkerSlot::live) {
            let mut polls: Vec<libc::pollfd> = Vec::new();
            let mut owners: Vec<(usize, EventKind)> = Vec::new();

            for (slot_index, slot) in self.slots.iter().enumerate() {
                if !slot.live() {
                    continue;
                }
                // Channel before process fd: unread messages must win
                // over the exit notification.
                if let Some(pipe) = &slot.pipe {
                    polls.push(libc::pollfd {
                        fd: pipe.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    owners.push((slot_index, EventKind::Pipe));
                }
                if let Some(pidfd) = &slot.pidfd {
                    polls.push(libc::pollfd {
                        fd: pidfd.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    owners.push((slot_index, EventKind::Process));
                }
                if let Some(timer) = &slot.timer {
                    polls.push(libc::pollfd {
                        fd: timer.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    owners.push((slot_index, EventKind::Timer));
                }
            }

            // SAFETY: polls is a valid array of initialized pollfds.
            let rc = unsafe {
                libc::poll(polls.as_mut_ptr(), polls.len() as libc::nfds_t, -1)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SupervisorError::WaitFailure { source: err });
            }

            // Handle only the first ready entry, then re-poll: this is
            // what makes the channel-before-process ordering meaningful
            // when several fds are ready at once.
            let Some(ready) = polls.iter().position(|p| p.revents != 0) else {
                continue;
            };
            let (slot_index, kind) = owners[ready];
            match kind {
                EventKind::Pipe => self.handle_pipe_event(slot_index),
                EventKind::Process => self.handle_process_exit(slot_index)?,
                EventKind::Timer => self.handle_timer_expiry(slot_index)?,
            }
        }
        Ok(())
    }
}

/// Runs the full supervision cycle: partition, spawn, recover, report.
pub fn run_master(config: MasterConfig) -> Result<MasterReport, SupervisorError> {
    let exe = match &config.worker_exe {
        Some(path) => path.clone(),
        None => std::env::current_exe().map_err(|source| SupervisorError::SpawnFailure {
            slot: 0,
            source,
        })?,
    };

    let control = match (&config.shm_name, &config.shm_mutex_name) {
        (Some(shm), Some(mutex)) => {
            let result = if config.shm_create {
                ControlBlock::create(shm, mutex, TELEMETRY_RING_SIZE)
            } else {
                ControlBlock::attach(shm, mutex)
            };
            match result {
                Ok(block) => Some(block),
                Err(err) => {
                    eprintln!("replayer-rs: continuing without control block: {err}");
                    None
                }
            }
        }
        _ => None,
    };

    let counts = ArchiveSet::new(config.archives.clone()).count_pipelines()?;
    eprintln!(
        "replayer-rs: {} graphics and {} compute pipelines across {} archives, {} workers",
        counts.graphics,
        counts.compute,
        config.archives.len(),
        config.worker_count,
    );

    if let Some(control) = &control {
        control.set_progress_started();
    }

    let workers = config.worker_count.max(1);
    let mut master = Master {
        slots: (0..workers)
            .map(|i| {
                WorkerSlot::new(
                    i,
                    partition(counts.graphics, workers, i),
                    partition(counts.compute, workers, i),
                )
            })
            .collect(),
        config,
        exe,
        blacklist: AHashSet::new(),
        control,
        report: MasterReport::default(),
    };

    for slot_index in 0..master.slots.len() {
        master.spawn_worker(slot_index)?;
    }

    master.run()?;

    if let Some(control) = &master.control {
        control.set_progress_complete();
    }

    master.report.banned_modules = master.blacklist.len();
    Ok(master.report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_range_exactly() {
        let parts: Vec<_> = (0..3).map(|i| partition(9, 3, i)).collect();
        assert_eq!(parts, vec![0..3, 3..6, 6..9]);
        let parts: Vec<_> = (0..3).map(|i| partition(6, 3, i)).collect();
        assert_eq!(parts, vec![0..2, 2..4, 4..6]);
    }

    #[test]
    fn partition_handles_uneven_and_empty_totals() {
        let parts: Vec<_> = (0..4).map(|i| partition(10, 4, i)).collect();
        assert_eq!(parts, vec![0..2, 2..5, 5..7, 7..10]);
        assert_eq!(parts.iter().map(|r| r.len()).sum::<usize>(), 10);

        for i in 0..5 {
            assert!(partition(0, 5, i).is_empty());
        }

        // More workers than work: some ranges are empty, none overlap.
        let parts: Vec<_> = (0..8).map(|i| partition(3, 8, i)).collect();
        assert_eq!(parts.iter().map(|r| r.len()).sum::<usize>(), 3);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
