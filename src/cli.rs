//! Command-line parser for the replay supervisor.
//!
//! Hand-rolled (no clap dependency) to keep binary size small and boot
//! fast; workers are spawned in bulk and respawned on crashes, so
//! startup cost is paid repeatedly.
//!
//! # Grammar
//!
//! ```text
//! replayer-rs [<archive.json>...] [MASTER_FLAGS]
//! replayer-rs [<archive.json>...] --slave-process
//!             --graphics-pipeline-range <start> <end>
//!             --compute-pipeline-range  <start> <end> [SHARED_FLAGS]
//! replayer-rs --help | -h
//! ```
//!
//! The slave surface is driven by the master and is not meant to be
//! typed by hand.

use std::env;
use std::path::PathBuf;

use crate::engine::EngineOptions;
use crate::supervisor::master::MasterConfig;
use crate::supervisor::worker::WorkerConfig;

/// Parsed invocation: supervise, or replay a range in-process.
pub enum RunConfig {
    Master(MasterConfig),
    Worker(WorkerConfig),
}

fn usage(exe: &str) {
    eprintln!("usage: {exe} [<archive.json>...] [options]");
    eprintln!();
    eprintln!("options:");
    eprintln!("  --num-threads <n>               worker process count (master) / thread count (slave)");
    eprintln!("  --quiet-slave                   silence worker stderr");
    eprintln!("  --shm-name <name>               shared control block name");
    eprintln!("  --shm-mutex-name <name>         shared control block mutex name");
    eprintln!("  --shm-create                    create the control block instead of attaching");
    eprintln!("  --pipeline-cache                replay through a driver pipeline cache");
    eprintln!("  --spirv-val                     validate shader code before building");
    eprintln!("  --on-disk-pipeline-cache <path> persist the driver cache at <path>");
    eprintln!("  --slave-process                 run as a replay worker (spawned by the master)");
    eprintln!("  --graphics-pipeline-range <start> <end>");
    eprintln!("  --compute-pipeline-range <start> <end>");
}

fn bail(exe: &str, message: &str) -> ! {
    eprintln!("error: {message}");
    eprintln!();
    usage(exe);
    std::process::exit(1);
}

struct ArgStream {
    exe: String,
    args: std::vec::IntoIter<String>,
}

impl ArgStream {
    fn value(&mut self, flag: &str) -> String {
        match self.args.next() {
            Some(value) => value,
            None => bail(&self.exe, &format!("{flag} requires a value")),
        }
    }

    fn u32_value(&mut self, flag: &str) -> u32 {
        let raw = self.value(flag);
        match raw.parse() {
            Ok(value) => value,
            Err(_) => bail(&self.exe, &format!("{flag}: '{raw}' is not a valid u32")),
        }
    }
}

/// Parses `std::env::args` into a [`RunConfig`].
///
/// Exits the process with code 1 on invalid arguments, printing a
/// diagnostic and usage summary to stderr.
pub fn parse_args() -> RunConfig {
    let mut raw = env::args();
    let exe = raw.next().unwrap_or_else(|| "replayer-rs".into());
    let mut stream = ArgStream {
        exe: exe.clone(),
        args: raw.collect::<Vec<_>>().into_iter(),
    };

    let mut archives: Vec<PathBuf> = Vec::new();
    let mut slave = false;
    let mut num_threads: Option<u32> = None;
    let mut quiet_slave = false;
    let mut shm_name: Option<String> = None;
    let mut shm_mutex_name: Option<String> = None;
    let mut shm_create = false;
    let mut engine = EngineOptions::default();
    // Full range until the master narrows it.
    let mut graphics_range = 0u32..u32::MAX;
    let mut compute_range = 0u32..u32::MAX;

    while let Some(arg) = stream.args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                usage(&exe);
                std::process::exit(0);
            }
            "--slave-process" => slave = true,
            "--num-threads" => num_threads = Some(stream.u32_value("--num-threads")),
            "--quiet-slave" => quiet_slave = true,
            "--shm-name" => shm_name = Some(stream.value("--shm-name")),
            "--shm-mutex-name" => shm_mutex_name = Some(stream.value("--shm-mutex-name")),
            "--shm-create" => shm_create = true,
            "--pipeline-cache" => engine.pipeline_cache = true,
            "--spirv-val" => engine.spirv_validate = true,
            "--on-disk-pipeline-cache" => {
                engine.on_disk_pipeline_cache =
                    Some(PathBuf::from(stream.value("--on-disk-pipeline-cache")));
            }
            "--graphics-pipeline-range" => {
                let start = stream.u32_value("--graphics-pipeline-range");
                let end = stream.u32_value("--graphics-pipeline-range");
                graphics_range = start..end;
            }
            "--compute-pipeline-range" => {
                let start = stream.u32_value("--compute-pipeline-range");
                let end = stream.u32_value("--compute-pipeline-range");
                compute_range = start..end;
            }
            flag if flag.starts_with("--") => {
                bail(&exe, &format!("unknown option '{flag}'"));
            }
            path => archives.push(PathBuf::from(path)),
        }
    }

    if archives.is_empty() {
        bail(&exe, "at least one archive path is required");
    }

    if slave {
        engine.num_threads = num_threads.unwrap_or(1);
        RunConfig::Worker(WorkerConfig {
            archives,
            ranges: crate::engine::PipelineRanges {
                graphics: graphics_range,
                compute: compute_range,
            },
            shm_name,
            shm_mutex_name,
            engine,
        })
    } else {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let worker_count = num_threads.unwrap_or(default_workers).max(1);
        RunConfig::Master(MasterConfig {
            archives,
            worker_count,
            quiet_slave,
            shm_name,
            shm_mutex_name,
            shm_create,
            engine,
            worker_exe: None,
        })
    }
}
