//! End-to-end supervision scenarios driving the real binary.
//!
//! A test archive is recorded through the library, written to disk, and
//! replayed by the actual master/worker processes. Failure modes are
//! injected through the `REPLAYER_FAULT` environment variable, which the
//! built-in engine turns into real process crashes, so these tests cover
//! the framed channel, the blacklist hand-off, the crash timeout, and
//! the control-block telemetry with no driver present.

use std::path::PathBuf;
use std::process::{Command, Output};

use replayer_rs::control::{ControlBlock, CONTROL_MESSAGE_SIZE};
use replayer_rs::hasher::Hash;
use replayer_rs::state::canon;
use replayer_rs::state::recorder::StateRecorder;
use replayer_rs::state::types::*;
use replayer_rs::vk;

const BIN: &str = env!("CARGO_BIN_EXE_replayer-rs");

/// Records an archive with `graphics` graphics pipelines (each over its
/// own shader module) and `compute` compute pipelines (each over its own
/// module as well). Returns the path and the per-pipeline graphics
/// module hashes.
fn write_archive(dir: &std::path::Path, graphics: u32, compute: u32) -> (PathBuf, Vec<Hash>) {
    let mut rec = StateRecorder::new();

    let layout = PipelineLayoutDesc {
        flags: 0,
        set_layouts: Vec::new(),
        push_constant_ranges: Vec::new(),
    };
    let hash = canon::pipeline_layout_hash(&layout, &rec).unwrap();
    rec.register_pipeline_layout(hash, layout);

    let pass = RenderPassDesc {
        flags: 0,
        attachments: Vec::new(),
        dependencies: Vec::new(),
        subpasses: Vec::new(),
    };
    rec.register_render_pass(canon::render_pass_hash(&pass), pass);

    let mut module_hashes = Vec::new();
    for i in 0..(graphics + compute) {
        let module = ShaderModuleDesc::from_words(0, vec![0x0723_0203, 0xfeed, i]);
        let hash = canon::shader_module_hash(&module);
        rec.register_shader_module(hash, module);
        module_hashes.push(hash);
    }

    for i in 0..graphics {
        let pipe = GraphicsPipelineDesc {
            flags: 0,
            base_pipeline_handle: 0,
            base_pipeline_index: 0,
            layout: Ref::from_index(0),
            render_pass: Ref::from_index(0),
            subpass: 0,
            stages: vec![ShaderStage {
                flags: 0,
                stage: vk::SHADER_STAGE_VERTEX,
                module: Ref::from_index(i),
                name: "main".to_owned(),
                specialization_info: None,
            }],
            vertex_input_state: None,
            input_assembly_state: None,
            tessellation_state: None,
            viewport_state: None,
            rasterization_state: None,
            multisample_state: None,
            depth_stencil_state: None,
            color_blend_state: None,
            dynamic_state: None,
        };
        let hash = canon::graphics_pipeline_hash(&pipe, &rec).unwrap();
        rec.register_graphics_pipeline(hash, pipe);
    }

    for i in 0..compute {
        let pipe = ComputePipelineDesc {
            flags: 0,
            base_pipeline_handle: 0,
            base_pipeline_index: 0,
            layout: Ref::from_index(0),
            stage: ShaderStage {
                flags: 0,
                stage: vk::SHADER_STAGE_COMPUTE,
                module: Ref::from_index(graphics + i),
                name: "main".to_owned(),
                specialization_info: None,
            },
        };
        let hash = canon::compute_pipeline_hash(&pipe, &rec).unwrap();
        rec.register_compute_pipeline(hash, pipe);
    }

    let path = dir.join("archive.json");
    std::fs::write(&path, rec.serialize()).unwrap();
    (path, module_hashes[..graphics as usize].to_vec())
}

fn unique_shm_names(tag: &str) -> (String, String) {
    let pid = std::process::id();
    (
        format!("/replayer-e2e-{tag}-{pid}"),
        format!("/replayer-e2e-{tag}-{pid}-mutex"),
    )
}

fn run_master(archive: &PathBuf, workers: u32, shm: Option<(&str, &str)>, fault: &str) -> Output {
    let mut cmd = Command::new(BIN);
    cmd.arg(archive).args(["--num-threads", &workers.to_string()]);
    if let Some((shm_name, mutex_name)) = shm {
        cmd.args(["--shm-name", shm_name, "--shm-mutex-name", mutex_name]);
    }
    if fault.is_empty() {
        cmd.env_remove("REPLAYER_FAULT");
    } else {
        cmd.env("REPLAYER_FAULT", fault);
    }
    cmd.output().unwrap()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn clean_run_retires_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), 9, 6);
    let (shm, mutex) = unique_shm_names("clean");
    let observer = ControlBlock::create(&shm, &mutex, 1024).unwrap();

    let output = run_master(&archive, 3, Some((&shm, &mutex)), "");
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");
    assert!(stderr.contains("replay complete"), "missing summary:\n{stderr}");

    assert!(observer.progress_started());
    assert!(observer.progress_complete());
    assert_eq!(observer.clean_process_deaths(), 3);
    assert_eq!(observer.dirty_process_deaths(), 0);
    assert_eq!(observer.banned_modules(), 0);
}

#[test]
fn crash_blacklists_module_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, graphics_modules) = write_archive(dir.path(), 3, 2);
    let (shm, mutex) = unique_shm_names("crash");
    let observer = ControlBlock::create(&shm, &mutex, 1024).unwrap();

    // The driver "faults" while compiling graphics pipeline 1.
    let target = graphics_modules[1];
    let fault = format!("crash-graphics-module={target:x}");
    let output = run_master(&archive, 1, Some((&shm, &mutex)), &fault);
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");
    assert!(stderr.contains("retrying"), "expected a respawn:\n{stderr}");
    assert!(
        stderr.contains("respawns=1") && stderr.contains("banned_modules=1"),
        "unexpected summary:\n{stderr}"
    );

    // One crash with progress, then a clean finish.
    assert_eq!(observer.clean_process_deaths(), 2);
    assert_eq!(observer.dirty_process_deaths(), 0);
    assert_eq!(observer.banned_modules(), 1);

    // The raw MODULE record reached the telemetry ring.
    let mut slot = [0u8; CONTROL_MESSAGE_SIZE];
    assert!(observer.read_message(&mut slot));
    let expected = format!("MODULE {target:016x}");
    assert!(
        slot.starts_with(expected.as_bytes()),
        "ring record {:?} does not match {expected}",
        String::from_utf8_lossy(&slot)
    );
    assert!(!observer.read_message(&mut slot));
}

#[test]
fn hung_teardown_is_terminated_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, graphics_modules) = write_archive(dir.path(), 2, 0);
    let (shm, mutex) = unique_shm_names("hang");
    let observer = ControlBlock::create(&shm, &mutex, 1024).unwrap();

    let target = graphics_modules[0];
    let fault = format!("crash-graphics-module={target:x};hang-teardown");
    let output = run_master(&archive, 1, Some((&shm, &mutex)), &fault);
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");
    assert!(
        stderr.contains("stuck in crash teardown"),
        "expected timeout termination:\n{stderr}"
    );
    assert!(stderr.contains("retrying"), "expected a respawn:\n{stderr}");

    // Progress was seen, so the death still counts as clean.
    assert_eq!(observer.dirty_process_deaths(), 0);
    assert_eq!(observer.banned_modules(), 1);
}

#[test]
fn early_crash_drops_range_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), 2, 1);
    let (shm, mutex) = unique_shm_names("early");
    let observer = ControlBlock::create(&shm, &mutex, 1024).unwrap();

    let output = run_master(&archive, 1, Some((&shm, &mutex)), "crash-early");
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");
    assert!(
        stderr.contains("before reporting progress"),
        "expected an unrecoverable early crash:\n{stderr}"
    );
    assert!(stderr.contains("dropped_slots=1"), "bad summary:\n{stderr}");

    assert_eq!(observer.clean_process_deaths(), 0);
    assert_eq!(observer.dirty_process_deaths(), 1);
    assert!(observer.progress_complete());
}

#[test]
fn zero_pipelines_complete_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("empty.json");
    std::fs::write(&archive, "{}").unwrap();
    let (shm, mutex) = unique_shm_names("empty");
    let observer = ControlBlock::create(&shm, &mutex, 1024).unwrap();

    let output = run_master(&archive, 2, Some((&shm, &mutex)), "");
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");

    assert!(observer.progress_complete());
    assert_eq!(observer.clean_process_deaths(), 2);
    assert_eq!(observer.dirty_process_deaths(), 0);
}

#[test]
fn corrupt_control_block_disables_telemetry_only() {
    let dir = tempfile::tempdir().unwrap();
    let (archive, _) = write_archive(dir.path(), 1, 1);

    // Names that exist for the semaphore but not the shared memory: the
    // attach fails and replay must proceed regardless.
    let (shm, mutex) = unique_shm_names("corrupt");
    let output = run_master(&archive, 1, Some((&shm, &mutex)), "");
    let stderr = stderr_of(&output);
    assert!(output.status.success(), "master failed:\n{stderr}");
    assert!(
        stderr.contains("continuing without control block"),
        "expected telemetry to be disabled:\n{stderr}"
    );
    assert!(stderr.contains("replay complete"), "missing summary:\n{stderr}");
}
