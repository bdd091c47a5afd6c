//! Serialized state document: one JSON object holding all seven
//! registries, and the replay path that feeds a parsed document back
//! into a pipeline factory.
//!
//! # Wire format
//!
//! Top-level keys `samplers`, `setLayouts`, `pipelineLayouts`,
//! `shaderModules`, `renderPasses`, `computePipelines`,
//! `graphicsPipelines`, each an array of records carrying `hash`,
//! `flags`, and the kind-specific fields. Cross-references are 1-based
//! indices (`0` = null). Shader-module code and specialization payloads
//! are Base64 with explicit byte lengths. A missing top-level array is
//! read as empty.
//!
//! # Replay ordering
//!
//! Kinds are replayed in dependency order: samplers, set layouts,
//! pipeline layouts, shader modules, render passes, compute pipelines,
//! graphics pipelines. For each kind the factory sees `set_num_*`, one
//! `enqueue_create_*` per element in registry order, then
//! `wait_enqueue()` as a barrier, so an engine with internal creation
//! queues has every element of a kind finished before any element of a
//! later kind references it.
//!
//! The whole document is validated before the first callback; a
//! [`ReplayError`] therefore implies the factory saw nothing.

use serde::{Deserialize, Serialize};

use crate::errors::ReplayError;
use crate::hasher::Hash;
use crate::state::recorder::{Record, StateRecorder};
use crate::state::types::*;

/// In-memory form of the serialized document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(default)]
    pub samplers: Vec<Record<SamplerDesc>>,
    #[serde(default)]
    pub set_layouts: Vec<Record<SetLayoutDesc>>,
    #[serde(default)]
    pub pipeline_layouts: Vec<Record<PipelineLayoutDesc>>,
    #[serde(default)]
    pub shader_modules: Vec<Record<ShaderModuleDesc>>,
    #[serde(default)]
    pub render_passes: Vec<Record<RenderPassDesc>>,
    #[serde(default)]
    pub compute_pipelines: Vec<Record<ComputePipelineDesc>>,
    #[serde(default)]
    pub graphics_pipelines: Vec<Record<GraphicsPipelineDesc>>,
}

/// Consumer of a replayed document.
///
/// Implemented by the replayer engine; tests use recording stubs. All
/// `enqueue_create_*` calls for one kind land between that kind's
/// `set_num_*` and the following `wait_enqueue()`.
pub trait PipelineFactory {
    fn set_num_samplers(&mut self, count: u32);
    fn enqueue_create_sampler(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &SamplerDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_set_layouts(&mut self, count: u32);
    fn enqueue_create_set_layout(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &SetLayoutDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_pipeline_layouts(&mut self, count: u32);
    fn enqueue_create_pipeline_layout(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &PipelineLayoutDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_shader_modules(&mut self, count: u32);
    fn enqueue_create_shader_module(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &ShaderModuleDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_render_passes(&mut self, count: u32);
    fn enqueue_create_render_pass(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &RenderPassDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_compute_pipelines(&mut self, count: u32);
    fn enqueue_create_compute_pipeline(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &ComputePipelineDesc,
    ) -> Result<(), ReplayError>;

    fn set_num_graphics_pipelines(&mut self, count: u32);
    fn enqueue_create_graphics_pipeline(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &GraphicsPipelineDesc,
    ) -> Result<(), ReplayError>;

    /// Barrier: all enqueued creations of the current kind are complete
    /// when this returns.
    fn wait_enqueue(&mut self);
}

/// Serializes all seven registries of a recorder to the document text.
pub fn serialize_recorder(recorder: &StateRecorder) -> String {
    let doc = StateDocument {
        samplers: recorder.samplers().to_vec(),
        set_layouts: recorder.set_layouts().to_vec(),
        pipeline_layouts: recorder.pipeline_layouts().to_vec(),
        shader_modules: recorder.shader_modules().to_vec(),
        render_passes: recorder.render_passes().to_vec(),
        compute_pipelines: recorder.compute_pipelines().to_vec(),
        graphics_pipelines: recorder.graphics_pipelines().to_vec(),
    };
    serialize_document(&doc)
}

/// Serializes a document to pretty-printed JSON.
pub fn serialize_document(doc: &StateDocument) -> String {
    // The schema contains no map keys or non-string data that could fail
    // to serialize; an error here would be a programming bug.
    serde_json::to_string_pretty(doc).unwrap_or_else(|e| {
        unreachable!("state document serialization cannot fail: {e}")
    })
}

/// Parses and validates a document without touching any factory.
pub fn parse_document(text: &str) -> Result<StateDocument, ReplayError> {
    let doc: StateDocument = serde_json::from_str(text).map_err(ReplayError::malformed)?;
    validate(&doc)?;
    Ok(doc)
}

/// Parses a document and replays it into `factory`.
pub fn parse<F: PipelineFactory>(text: &str, factory: &mut F) -> Result<(), ReplayError> {
    let doc = parse_document(text)?;
    replay(&doc, factory)
}

fn check_ref<K>(
    reference: Ref<K>,
    kind: &'static str,
    len: usize,
) -> Result<(), ReplayError> {
    match reference.index() {
        Some(index) if index as usize >= len => Err(ReplayError::DanglingReference {
            kind,
            index: reference.raw(),
            len: len as u32,
        }),
        _ => Ok(()),
    }
}

fn check_stage(stage: &ShaderStage, modules: usize) -> Result<(), ReplayError> {
    check_ref(stage.module, "shader module", modules)
}

/// Validates every cross-reference in the document.
pub fn validate(doc: &StateDocument) -> Result<(), ReplayError> {
    for layout in &doc.set_layouts {
        for binding in &layout.desc.bindings {
            if let Some(samplers) = &binding.immutable_samplers {
                for sampler in samplers {
                    check_ref(*sampler, "sampler", doc.samplers.len())?;
                }
            }
        }
    }
    for layout in &doc.pipeline_layouts {
        for set_layout in &layout.desc.set_layouts {
            check_ref(*set_layout, "descriptor set layout", doc.set_layouts.len())?;
        }
    }
    for pipe in &doc.compute_pipelines {
        check_ref(
            pipe.desc.layout,
            "pipeline layout",
            doc.pipeline_layouts.len(),
        )?;
        check_stage(&pipe.desc.stage, doc.shader_modules.len())?;
    }
    for pipe in &doc.graphics_pipelines {
        check_ref(
            pipe.desc.layout,
            "pipeline layout",
            doc.pipeline_layouts.len(),
        )?;
        check_ref(pipe.desc.render_pass, "render pass", doc.render_passes.len())?;
        for stage in &pipe.desc.stages {
            check_stage(stage, doc.shader_modules.len())?;
        }
    }
    Ok(())
}

macro_rules! replay_kind {
    ($doc:expr, $factory:expr, $records:ident, $set_num:ident, $enqueue:ident) => {
        $factory.$set_num($doc.$records.len() as u32);
        for (index, record) in $doc.$records.iter().enumerate() {
            $factory.$enqueue(record.hash, index as u32, &record.desc)?;
        }
        $factory.wait_enqueue();
    };
}

/// Replays a validated document into `factory`, kind by kind in
/// dependency order.
pub fn replay<F: PipelineFactory>(
    doc: &StateDocument,
    factory: &mut F,
) -> Result<(), ReplayError> {
    validate(doc)?;
    replay_kind!(doc, factory, samplers, set_num_samplers, enqueue_create_sampler);
    replay_kind!(doc, factory, set_layouts, set_num_set_layouts, enqueue_create_set_layout);
    replay_kind!(
        doc,
        factory,
        pipeline_layouts,
        set_num_pipeline_layouts,
        enqueue_create_pipeline_layout
    );
    replay_kind!(
        doc,
        factory,
        shader_modules,
        set_num_shader_modules,
        enqueue_create_shader_module
    );
    replay_kind!(doc, factory, render_passes, set_num_render_passes, enqueue_create_render_pass);
    replay_kind!(
        doc,
        factory,
        compute_pipelines,
        set_num_compute_pipelines,
        enqueue_create_compute_pipeline
    );
    replay_kind!(
        doc,
        factory,
        graphics_pipelines,
        set_num_graphics_pipelines,
        enqueue_create_graphics_pipeline
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::canon;
    use crate::state::test_fixtures as fx;

    /// Factory stub that only counts callbacks.
    #[derive(Default)]
    struct CountingFactory {
        calls: Vec<&'static str>,
    }

    macro_rules! counting_impl {
        ($set_num:ident, $enqueue:ident, $desc:ty, $label:literal) => {
            fn $set_num(&mut self, _count: u32) {}
            fn $enqueue(
                &mut self,
                _hash: Hash,
                _index: u32,
                _desc: &$desc,
            ) -> Result<(), ReplayError> {
                self.calls.push($label);
                Ok(())
            }
        };
    }

    impl PipelineFactory for CountingFactory {
        counting_impl!(set_num_samplers, enqueue_create_sampler, SamplerDesc, "sampler");
        counting_impl!(
            set_num_set_layouts,
            enqueue_create_set_layout,
            SetLayoutDesc,
            "set layout"
        );
        counting_impl!(
            set_num_pipeline_layouts,
            enqueue_create_pipeline_layout,
            PipelineLayoutDesc,
            "pipeline layout"
        );
        counting_impl!(
            set_num_shader_modules,
            enqueue_create_shader_module,
            ShaderModuleDesc,
            "shader module"
        );
        counting_impl!(
            set_num_render_passes,
            enqueue_create_render_pass,
            RenderPassDesc,
            "render pass"
        );
        counting_impl!(
            set_num_compute_pipelines,
            enqueue_create_compute_pipeline,
            ComputePipelineDesc,
            "compute pipeline"
        );
        counting_impl!(
            set_num_graphics_pipelines,
            enqueue_create_graphics_pipeline,
            GraphicsPipelineDesc,
            "graphics pipeline"
        );
        fn wait_enqueue(&mut self) {}
    }

    fn recorded_document() -> StateDocument {
        let mut rec = fx::recorder_with_layout_and_pass();
        let pipe = fx::graphics_pipeline();
        let hash = canon::graphics_pipeline_hash(&pipe, &rec).unwrap();
        rec.register_graphics_pipeline(hash, pipe);
        let compute = fx::compute_pipeline();
        let hash = canon::compute_pipeline_hash(&compute, &rec).unwrap();
        rec.register_compute_pipeline(hash, compute);
        parse_document(&rec.serialize()).unwrap()
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let doc = recorded_document();
        let text = serialize_document(&doc);
        let back = parse_document(&text).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn missing_arrays_parse_as_empty() {
        let doc = parse_document("{}").unwrap();
        assert!(doc.samplers.is_empty());
        assert!(doc.graphics_pipelines.is_empty());
    }

    #[test]
    fn invalid_json_is_malformed() {
        match parse_document("{") {
            Err(ReplayError::MalformedDocument { .. }) => {}
            other => panic!("expected MalformedDocument, got {other:?}"),
        }
    }

    #[test]
    fn dangling_reference_fails_before_any_callback() {
        let mut doc = recorded_document();
        doc.graphics_pipelines[0].desc.render_pass = Ref::from_index(5);
        let text = serialize_document(&doc);
        let mut factory = CountingFactory::default();
        match parse(&text, &mut factory) {
            Err(ReplayError::DanglingReference { kind, .. }) => {
                assert_eq!(kind, "render pass");
            }
            other => panic!("expected DanglingReference, got {other:?}"),
        }
        assert!(factory.calls.is_empty(), "factory saw callbacks on error");
    }

    #[test]
    fn replay_visits_kinds_in_dependency_order() {
        let doc = recorded_document();
        let mut factory = CountingFactory::default();
        replay(&doc, &mut factory).unwrap();
        assert_eq!(
            factory.calls,
            vec![
                "pipeline layout",
                "shader module",
                "render pass",
                "compute pipeline",
                "graphics pipeline",
            ]
        );
    }

    #[test]
    fn null_references_are_tolerated() {
        let mut doc = StateDocument::default();
        doc.pipeline_layouts.push(Record {
            hash: 1,
            desc: PipelineLayoutDesc {
                flags: 0,
                set_layouts: vec![Ref::NONE],
                push_constant_ranges: Vec::new(),
            },
        });
        validate(&doc).unwrap();
    }
}
