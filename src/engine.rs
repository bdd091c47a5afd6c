//! The replayer engine: the in-process collaborator that turns parsed
//! state into driver pipeline objects.
//!
//! The actual graphics-API calls live behind this boundary and are out
//! of scope here; the built-in engine is a null driver that resolves
//! references, honors the shader-module blacklist, and advances the
//! crash-visible progress counters exactly like a real driver-backed
//! engine would. Because any pipeline build may take the process down,
//! everything the crash handler needs is published through
//! [`CrashVisible`]: plain atomics a signal handler can read on any
//! thread.
//!
//! Fault injection: the `REPLAYER_FAULT` environment variable lets tests
//! force the failure modes a real driver produces (a crash while
//! compiling a pipeline that references a given module, a crash before
//! the engine is live, a teardown that never returns). See
//! [`FaultPlan::from_env`].

use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashSet;

use crate::errors::ReplayError;
use crate::hasher::Hash;
use crate::state::document::PipelineFactory;
use crate::state::types::*;

/// Engine options forwarded from the command line.
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    pub num_threads: u32,
    pub pipeline_cache: bool,
    pub spirv_validate: bool,
    pub on_disk_pipeline_cache: Option<PathBuf>,
}

/// Half-open global pipeline-index ranges a worker owns.
#[derive(Clone, Debug)]
pub struct PipelineRanges {
    pub graphics: Range<u32>,
    pub compute: Range<u32>,
}

impl PipelineRanges {
    /// A range pair covering nothing; the worker exits immediately.
    pub fn empty() -> Self {
        Self {
            graphics: 0..0,
            compute: 0..0,
        }
    }
}

/// Cap on modules reported from one crash episode.
pub const MAX_IMPLICATED_MODULES: usize = 16;

/// Engine state readable from a crash context.
///
/// The crash handler may fire on any thread and is restricted to reading
/// these atomics, writing framed bytes, and calling
/// [`emergency_teardown`]. No field here is ever accessed with anything
/// stronger than atomic loads from that context.
pub struct CrashVisible {
    pub current_graphics_index: AtomicU32,
    pub current_compute_index: AtomicU32,
    implicated_count: AtomicUsize,
    implicated: [AtomicU64; MAX_IMPLICATED_MODULES],
    hang_teardown: AtomicU32,
}

impl CrashVisible {
    pub fn new() -> Self {
        Self {
            current_graphics_index: AtomicU32::new(0),
            current_compute_index: AtomicU32::new(0),
            implicated_count: AtomicUsize::new(0),
            implicated: std::array::from_fn(|_| AtomicU64::new(0)),
            hang_teardown: AtomicU32::new(0),
        }
    }

    /// Publishes the modules involved in the pipeline about to be built.
    /// Cleared again once the build returns.
    pub fn publish_implicated(&self, hashes: &[Hash]) {
        let count = hashes.len().min(MAX_IMPLICATED_MODULES);
        // Count-last so a handler racing this sees only written slots.
        self.implicated_count.store(0, Ordering::Relaxed);
        for (slot, &hash) in self.implicated.iter().zip(hashes) {
            slot.store(hash, Ordering::Relaxed);
        }
        self.implicated_count.store(count, Ordering::Release);
    }

    pub fn clear_implicated(&self) {
        self.implicated_count.store(0, Ordering::Release);
    }

    /// Snapshot of the implicated-module list for the crash handler.
    pub fn implicated_modules(&self, out: &mut [Hash; MAX_IMPLICATED_MODULES]) -> usize {
        let count = self
            .implicated_count
            .load(Ordering::Acquire)
            .min(MAX_IMPLICATED_MODULES);
        for (i, slot) in self.implicated.iter().enumerate().take(count) {
            out[i] = slot.load(Ordering::Relaxed);
        }
        count
    }
}

impl Default for CrashVisible {
    fn default() -> Self {
        Self::new()
    }
}

/// Flushes driver-side cache writers before the process dies. Callable
/// from a crash context; may never return if the driver state is wedged,
/// which the supervisor covers with its crash timeout.
pub fn emergency_teardown(vis: &CrashVisible) {
    while vis.hang_teardown.load(Ordering::Relaxed) != 0 {
        // SAFETY: sleep is async-signal-safe.
        unsafe {
            libc::sleep(1);
        }
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// Failure modes injectable through `REPLAYER_FAULT`.
///
/// Directive list separated by `;`:
/// `crash-graphics-module=<hex>` / `crash-compute-module=<hex>` crash
/// while compiling a pipeline whose stage references the module;
/// `crash-early` dies before the engine is live; `hang-teardown` makes
/// the post-crash teardown spin forever.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    pub crash_graphics_module: Option<Hash>,
    pub crash_compute_module: Option<Hash>,
    pub crash_early: bool,
    pub hang_teardown: bool,
}

impl FaultPlan {
    pub fn from_env() -> Self {
        match std::env::var("REPLAYER_FAULT") {
            Ok(spec) => Self::parse(&spec),
            Err(_) => Self::default(),
        }
    }

    fn parse(spec: &str) -> Self {
        let mut plan = Self::default();
        for directive in spec.split(';').filter(|d| !d.is_empty()) {
            match directive.split_once('=') {
                Some(("crash-graphics-module", hex)) => {
                    plan.crash_graphics_module = u64::from_str_radix(hex, 16).ok();
                }
                Some(("crash-compute-module", hex)) => {
                    plan.crash_compute_module = u64::from_str_radix(hex, 16).ok();
                }
                None if directive == "crash-early" => plan.crash_early = true,
                None if directive == "hang-teardown" => plan.hang_teardown = true,
                _ => eprintln!("replayer-rs: ignoring unknown fault directive '{directive}'"),
            }
        }
        plan
    }
}

// ============================================================================
// Null-driver engine
// ============================================================================

/// Per-run replay statistics, reported on worker stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayStats {
    pub graphics_built: u32,
    pub compute_built: u32,
    pub skipped_blacklisted: u32,
    pub out_of_range: u32,
}

/// Null-driver replayer engine.
///
/// Consumes a parsed document through [`PipelineFactory`]. Creation
/// callbacks for non-pipeline kinds fill index-keyed slot tables so
/// pipeline callbacks can resolve their references; pipeline callbacks
/// honor the owned index range, the blacklist, and the fault plan.
pub struct ReplayerEngine {
    #[allow(dead_code)]
    options: EngineOptions,
    ranges: PipelineRanges,
    blacklist: AHashSet<Hash>,
    fault: FaultPlan,
    vis: Arc<CrashVisible>,

    // Index-keyed tables for the current document. Handles are synthetic
    // for the null driver; a driver-backed engine stores its objects.
    sampler_slots: Vec<u64>,
    set_layout_slots: Vec<u64>,
    pipeline_layout_slots: Vec<u64>,
    module_hashes: Vec<Hash>,
    render_pass_slots: Vec<u64>,

    // Global pipeline-index bases for multi-archive replay.
    graphics_base: u32,
    compute_base: u32,
    doc_graphics: u32,
    doc_compute: u32,

    stats: ReplayStats,
}

impl ReplayerEngine {
    pub fn new(options: EngineOptions, ranges: PipelineRanges, fault: FaultPlan) -> Self {
        let vis = Arc::new(CrashVisible::new());
        vis.current_graphics_index
            .store(ranges.graphics.start, Ordering::Relaxed);
        vis.current_compute_index
            .store(ranges.compute.start, Ordering::Relaxed);
        if fault.hang_teardown {
            vis.hang_teardown.store(1, Ordering::Relaxed);
        }
        Self {
            options,
            ranges,
            blacklist: AHashSet::new(),
            fault,
            vis,
            sampler_slots: Vec::new(),
            set_layout_slots: Vec::new(),
            pipeline_layout_slots: Vec::new(),
            module_hashes: Vec::new(),
            render_pass_slots: Vec::new(),
            graphics_base: 0,
            compute_base: 0,
            doc_graphics: 0,
            doc_compute: 0,
            stats: ReplayStats::default(),
        }
    }

    /// Marks a module so pipelines referencing it are skipped.
    pub fn mask_shader_module(&mut self, hash: Hash) {
        self.blacklist.insert(hash);
    }

    pub fn masked_module_count(&self) -> usize {
        self.blacklist.len()
    }

    /// The crash-visible surface, for publication to the crash handler.
    pub fn crash_visible(&self) -> Arc<CrashVisible> {
        Arc::clone(&self.vis)
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Closes out the current document: later documents continue the
    /// global pipeline numbering and get fresh slot tables.
    pub fn finish_document(&mut self) {
        self.graphics_base += self.doc_graphics;
        self.compute_base += self.doc_compute;
        self.doc_graphics = 0;
        self.doc_compute = 0;
        self.sampler_slots.clear();
        self.set_layout_slots.clear();
        self.pipeline_layout_slots.clear();
        self.module_hashes.clear();
        self.render_pass_slots.clear();
    }

    fn stage_module_hashes(&self, stages: &[ShaderStage], out: &mut Vec<Hash>) {
        out.clear();
        for stage in stages {
            if let Some(index) = stage.module.index() {
                if let Some(&hash) = self.module_hashes.get(index as usize) {
                    out.push(hash);
                }
            }
        }
    }

    fn any_blacklisted(&self, hashes: &[Hash]) -> bool {
        hashes.iter().any(|h| self.blacklist.contains(h))
    }

    /// The null driver's "compile": crashes if the fault plan implicates
    /// one of the involved modules, otherwise succeeds.
    fn compile(&self, involved: &[Hash], fault_module: Option<Hash>) {
        if let Some(target) = fault_module {
            if involved.contains(&target) {
                // Dies exactly like a driver fault inside the build
                // call; the crash handler takes over from here.
                std::process::abort();
            }
        }
    }

    fn synthetic_handle(kind: u64, index: u32) -> u64 {
        (kind << 32) | u64::from(index + 1)
    }
}

impl PipelineFactory for ReplayerEngine {
    fn set_num_samplers(&mut self, count: u32) {
        self.sampler_slots = Vec::with_capacity(count as usize);
    }

    fn enqueue_create_sampler(
        &mut self,
        _hash: Hash,
        index: u32,
        _desc: &SamplerDesc,
    ) -> Result<(), ReplayError> {
        self.sampler_slots.push(Self::synthetic_handle(1, index));
        Ok(())
    }

    fn set_num_set_layouts(&mut self, count: u32) {
        self.set_layout_slots = Vec::with_capacity(count as usize);
    }

    fn enqueue_create_set_layout(
        &mut self,
        _hash: Hash,
        index: u32,
        _desc: &SetLayoutDesc,
    ) -> Result<(), ReplayError> {
        self.set_layout_slots.push(Self::synthetic_handle(2, index));
        Ok(())
    }

    fn set_num_pipeline_layouts(&mut self, count: u32) {
        self.pipeline_layout_slots = Vec::with_capacity(count as usize);
    }

    fn enqueue_create_pipeline_layout(
        &mut self,
        _hash: Hash,
        index: u32,
        _desc: &PipelineLayoutDesc,
    ) -> Result<(), ReplayError> {
        self.pipeline_layout_slots
            .push(Self::synthetic_handle(3, index));
        Ok(())
    }

    fn set_num_shader_modules(&mut self, count: u32) {
        self.module_hashes = Vec::with_capacity(count as usize);
    }

    fn enqueue_create_shader_module(
        &mut self,
        hash: Hash,
        _index: u32,
        _desc: &ShaderModuleDesc,
    ) -> Result<(), ReplayError> {
        // Blacklisted modules are still registered in the slot table so
        // references resolve; only pipeline builds consult the mask.
        self.module_hashes.push(hash);
        Ok(())
    }

    fn set_num_render_passes(&mut self, count: u32) {
        self.render_pass_slots = Vec::with_capacity(count as usize);
    }

    fn enqueue_create_render_pass(
        &mut self,
        _hash: Hash,
        index: u32,
        _desc: &RenderPassDesc,
    ) -> Result<(), ReplayError> {
        self.render_pass_slots
            .push(Self::synthetic_handle(4, index));
        Ok(())
    }

    fn set_num_compute_pipelines(&mut self, count: u32) {
        self.doc_compute = count;
    }

    fn enqueue_create_compute_pipeline(
        &mut self,
        _hash: Hash,
        index: u32,
        desc: &ComputePipelineDesc,
    ) -> Result<(), ReplayError> {
        let global = self.compute_base + index;
        if !self.ranges.compute.contains(&global) {
            self.stats.out_of_range += 1;
            return Ok(());
        }
        self.vis
            .current_compute_index
            .store(global, Ordering::Relaxed);

        let mut involved = Vec::new();
        self.stage_module_hashes(std::slice::from_ref(&desc.stage), &mut involved);
        if self.any_blacklisted(&involved) {
            self.stats.skipped_blacklisted += 1;
            return Ok(());
        }

        self.vis.publish_implicated(&involved);
        self.compile(&involved, self.fault.crash_compute_module);
        self.vis.clear_implicated();
        self.stats.compute_built += 1;
        Ok(())
    }

    fn set_num_graphics_pipelines(&mut self, count: u32) {
        self.doc_graphics = count;
    }

    fn enqueue_create_graphics_pipeline(
        &mut self,
        _hash: Hash,
        index: u32,
        desc: &GraphicsPipelineDesc,
    ) -> Result<(), ReplayError> {
        let global = self.graphics_base + index;
        if !self.ranges.graphics.contains(&global) {
            self.stats.out_of_range += 1;
            return Ok(());
        }
        self.vis
            .current_graphics_index
            .store(global, Ordering::Relaxed);

        let mut involved = Vec::new();
        self.stage_module_hashes(&desc.stages, &mut involved);
        if self.any_blacklisted(&involved) {
            self.stats.skipped_blacklisted += 1;
            return Ok(());
        }

        self.vis.publish_implicated(&involved);
        self.compile(&involved, self.fault.crash_graphics_module);
        self.vis.clear_implicated();
        self.stats.graphics_built += 1;
        Ok(())
    }

    fn wait_enqueue(&mut self) {
        // The null driver creates synchronously; a driver-backed engine
        // drains its creation queue here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::canon;
    use crate::state::document;
    use crate::state::test_fixtures as fx;

    fn one_pipeline_doc() -> (document::StateDocument, Hash) {
        let mut rec = fx::recorder_with_layout_and_pass();
        let module_hash = rec.shader_module_hash_at(0).unwrap();
        let pipe = fx::graphics_pipeline();
        let hash = canon::graphics_pipeline_hash(&pipe, &rec).unwrap();
        rec.register_graphics_pipeline(hash, pipe);
        let doc = document::parse_document(&rec.serialize()).unwrap();
        (doc, module_hash)
    }

    #[test]
    fn builds_pipelines_in_range() {
        let (doc, _) = one_pipeline_doc();
        let mut engine = ReplayerEngine::new(
            EngineOptions::default(),
            PipelineRanges {
                graphics: 0..1,
                compute: 0..0,
            },
            FaultPlan::default(),
        );
        document::replay(&doc, &mut engine).unwrap();
        assert_eq!(engine.stats().graphics_built, 1);
        assert_eq!(engine.stats().skipped_blacklisted, 0);
    }

    #[test]
    fn out_of_range_pipelines_are_not_built() {
        let (doc, _) = one_pipeline_doc();
        let mut engine = ReplayerEngine::new(
            EngineOptions::default(),
            PipelineRanges::empty(),
            FaultPlan::default(),
        );
        document::replay(&doc, &mut engine).unwrap();
        assert_eq!(engine.stats().graphics_built, 0);
        assert_eq!(engine.stats().out_of_range, 1);
    }

    #[test]
    fn blacklisted_module_skips_pipeline() {
        let (doc, module_hash) = one_pipeline_doc();
        let mut engine = ReplayerEngine::new(
            EngineOptions::default(),
            PipelineRanges {
                graphics: 0..1,
                compute: 0..0,
            },
            FaultPlan::default(),
        );
        engine.mask_shader_module(module_hash);
        document::replay(&doc, &mut engine).unwrap();
        assert_eq!(engine.stats().graphics_built, 0);
        assert_eq!(engine.stats().skipped_blacklisted, 1);
    }

    #[test]
    fn progress_counter_tracks_current_index() {
        let (doc, _) = one_pipeline_doc();
        let mut engine = ReplayerEngine::new(
            EngineOptions::default(),
            PipelineRanges {
                graphics: 0..1,
                compute: 0..0,
            },
            FaultPlan::default(),
        );
        let vis = engine.crash_visible();
        document::replay(&doc, &mut engine).unwrap();
        assert_eq!(vis.current_graphics_index.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn fault_plan_parses_directives() {
        let plan = FaultPlan::parse("crash-graphics-module=deadbeef;hang-teardown");
        assert_eq!(plan.crash_graphics_module, Some(0xdead_beef));
        assert!(plan.hang_teardown);
        assert!(!plan.crash_early);
        let plan = FaultPlan::parse("crash-early");
        assert!(plan.crash_early);
    }

    #[test]
    fn document_bases_accumulate() {
        let (doc, _) = one_pipeline_doc();
        let mut engine = ReplayerEngine::new(
            EngineOptions::default(),
            PipelineRanges {
                graphics: 0..2,
                compute: 0..0,
            },
            FaultPlan::default(),
        );
        document::replay(&doc, &mut engine).unwrap();
        engine.finish_document();
        document::replay(&doc, &mut engine).unwrap();
        let vis = engine.crash_visible();
        // Second document's only pipeline is global index 1.
        assert_eq!(vis.current_graphics_index.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().graphics_built, 2);
    }
}
