//! End-to-end round-trip of the recorded state document: record a small
//! catalogue, serialize it, and replay the text into a stub factory that
//! records every callback.

use replayer_rs::hasher::Hash;
use replayer_rs::state::canon;
use replayer_rs::state::document::{self, PipelineFactory};
use replayer_rs::state::recorder::StateRecorder;
use replayer_rs::state::types::*;
use replayer_rs::errors::ReplayError;
use replayer_rs::vk;

fn sampler_desc() -> SamplerDesc {
    SamplerDesc {
        flags: 0,
        mag_filter: 1,
        min_filter: 0,
        mipmap_mode: 1,
        address_mode_u: 2,
        address_mode_v: 0,
        address_mode_w: 1,
        mip_lod_bias: 0.5,
        anisotropy_enable: 1,
        max_anisotropy: 8.0,
        compare_enable: 0,
        compare_op: 0,
        min_lod: 0.0,
        max_lod: 12.0,
        border_color: 2,
        unnormalized_coordinates: 0,
    }
}

/// Builds the reference catalogue: one sampler, one set layout holding
/// it as an immutable sampler, one pipeline layout, one shader module,
/// one compute pipeline.
fn record_catalogue() -> StateRecorder {
    let mut rec = StateRecorder::new();

    let sampler = sampler_desc();
    let sampler_hash = canon::sampler_hash(&sampler);
    let sampler_index = rec.register_sampler(sampler_hash, sampler);
    rec.set_sampler_handle(sampler_index, 0x1000);

    let set_layout = SetLayoutDesc {
        flags: 0,
        bindings: vec![SetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DESCRIPTOR_TYPE_COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::SHADER_STAGE_FRAGMENT,
            immutable_samplers: Some(vec![rec.ref_for_sampler(0x1000).unwrap()]),
        }],
    };
    let set_layout_hash = canon::set_layout_hash(&set_layout, &rec).unwrap();
    let set_layout_index = rec.register_set_layout(set_layout_hash, set_layout);
    rec.set_set_layout_handle(set_layout_index, 0x2000);

    let pipeline_layout = PipelineLayoutDesc {
        flags: 0,
        set_layouts: vec![rec.ref_for_set_layout(0x2000).unwrap()],
        push_constant_ranges: vec![PushConstantRange {
            stage_flags: vk::SHADER_STAGE_COMPUTE,
            offset: 0,
            size: 16,
        }],
    };
    let pipeline_layout_hash = canon::pipeline_layout_hash(&pipeline_layout, &rec).unwrap();
    let pipeline_layout_index = rec.register_pipeline_layout(pipeline_layout_hash, pipeline_layout);
    rec.set_pipeline_layout_handle(pipeline_layout_index, 0x3000);

    let module = ShaderModuleDesc::from_words(0, vec![0x0723_0203, 7, 11, 13]);
    let module_hash = canon::shader_module_hash(&module);
    let module_index = rec.register_shader_module(module_hash, module);
    rec.set_shader_module_handle(module_index, 0x4000);

    let compute = ComputePipelineDesc {
        flags: 0,
        base_pipeline_handle: 0,
        base_pipeline_index: 0,
        layout: rec.ref_for_pipeline_layout(0x3000).unwrap(),
        stage: ShaderStage {
            flags: 0,
            stage: vk::SHADER_STAGE_COMPUTE,
            module: rec.ref_for_shader_module(0x4000).unwrap(),
            name: "main".to_owned(),
            specialization_info: Some(SpecializationInfo {
                data: vec![1, 0, 0, 0],
                map_entries: vec![SpecMapEntry {
                    constant_id: 0,
                    offset: 0,
                    size: 4,
                }],
            }),
        },
    };
    let compute_hash = canon::compute_pipeline_hash(&compute, &rec).unwrap();
    let compute_index = rec.register_compute_pipeline(compute_hash, compute);
    rec.set_compute_pipeline_handle(compute_index, 0x5000);

    rec
}

/// Replay callbacks in arrival order.
#[derive(Debug, PartialEq)]
enum Call {
    SetNum(&'static str, u32),
    Create(&'static str, Hash, u32),
    Wait,
}

#[derive(Default)]
struct RecordingFactory {
    calls: Vec<Call>,
    set_layouts: Vec<SetLayoutDesc>,
    compute_pipelines: Vec<ComputePipelineDesc>,
    shader_modules: Vec<ShaderModuleDesc>,
}

macro_rules! recording_impl {
    ($set_num:ident, $enqueue:ident, $desc:ty, $label:literal) => {
        fn $set_num(&mut self, count: u32) {
            self.calls.push(Call::SetNum($label, count));
        }
        fn $enqueue(
            &mut self,
            hash: Hash,
            index: u32,
            _desc: &$desc,
        ) -> Result<(), ReplayError> {
            self.calls.push(Call::Create($label, hash, index));
            Ok(())
        }
    };
}

impl PipelineFactory for RecordingFactory {
    recording_impl!(set_num_samplers, enqueue_create_sampler, SamplerDesc, "samplers");

    fn set_num_set_layouts(&mut self, count: u32) {
        self.calls.push(Call::SetNum("setLayouts", count));
    }
    fn enqueue_create_set_layout(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &SetLayoutDesc,
    ) -> Result<(), ReplayError> {
        self.calls.push(Call::Create("setLayouts", hash, index));
        self.set_layouts.push(desc.clone());
        Ok(())
    }

    recording_impl!(
        set_num_pipeline_layouts,
        enqueue_create_pipeline_layout,
        PipelineLayoutDesc,
        "pipelineLayouts"
    );

    fn set_num_shader_modules(&mut self, count: u32) {
        self.calls.push(Call::SetNum("shaderModules", count));
    }
    fn enqueue_create_shader_module(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &ShaderModuleDesc,
    ) -> Result<(), ReplayError> {
        self.calls.push(Call::Create("shaderModules", hash, index));
        self.shader_modules.push(desc.clone());
        Ok(())
    }

    recording_impl!(
        set_num_render_passes,
        enqueue_create_render_pass,
        RenderPassDesc,
        "renderPasses"
    );

    fn set_num_compute_pipelines(&mut self, count: u32) {
        self.calls.push(Call::SetNum("computePipelines", count));
    }
    fn enqueue_create_compute_pipeline(
        &mut self,
        hash: Hash,
        index: u32,
        desc: &ComputePipelineDesc,
    ) -> Result<(), ReplayError> {
        self.calls.push(Call::Create("computePipelines", hash, index));
        self.compute_pipelines.push(desc.clone());
        Ok(())
    }

    recording_impl!(
        set_num_graphics_pipelines,
        enqueue_create_graphics_pipeline,
        GraphicsPipelineDesc,
        "graphicsPipelines"
    );

    fn wait_enqueue(&mut self) {
        self.calls.push(Call::Wait);
    }
}

#[test]
fn replay_callback_sequence_and_references() {
    let rec = record_catalogue();
    let sampler_hash = rec.sampler_hash_at(0).unwrap();
    let set_layout_hash = rec.set_layout_hash_at(0).unwrap();
    let pipeline_layout_hash = rec.pipeline_layout_hash_at(0).unwrap();
    let module_hash = rec.shader_module_hash_at(0).unwrap();
    let compute_hash = rec.compute_pipeline_hash_at(0).unwrap();

    let text = rec.serialize();
    let mut factory = RecordingFactory::default();
    document::parse(&text, &mut factory).unwrap();

    assert_eq!(
        factory.calls,
        vec![
            Call::SetNum("samplers", 1),
            Call::Create("samplers", sampler_hash, 0),
            Call::Wait,
            Call::SetNum("setLayouts", 1),
            Call::Create("setLayouts", set_layout_hash, 0),
            Call::Wait,
            Call::SetNum("pipelineLayouts", 1),
            Call::Create("pipelineLayouts", pipeline_layout_hash, 0),
            Call::Wait,
            Call::SetNum("shaderModules", 1),
            Call::Create("shaderModules", module_hash, 0),
            Call::Wait,
            Call::SetNum("renderPasses", 0),
            Call::Wait,
            Call::SetNum("computePipelines", 1),
            Call::Create("computePipelines", compute_hash, 0),
            Call::Wait,
            Call::SetNum("graphicsPipelines", 0),
            Call::Wait,
        ]
    );

    // The set layout's immutable sampler reference resolved to index 0.
    let binding = &factory.set_layouts[0].bindings[0];
    assert_eq!(
        binding.immutable_samplers.as_ref().unwrap()[0].index(),
        Some(0)
    );

    // The compute pipeline's references resolved to the right slots.
    let compute = &factory.compute_pipelines[0];
    assert_eq!(compute.layout.index(), Some(0));
    assert_eq!(compute.stage.module.index(), Some(0));
    assert_eq!(compute.stage.name, "main");

    // The shader payload survived the Base64 trip exactly.
    assert_eq!(
        factory.shader_modules[0].code_bytes(),
        ShaderModuleDesc::from_words(0, vec![0x0723_0203, 7, 11, 13]).code_bytes()
    );
}

#[test]
fn serialize_parse_serialize_is_stable() {
    let rec = record_catalogue();
    let first = rec.serialize();
    let doc = document::parse_document(&first).unwrap();
    let second = document::serialize_document(&doc);
    assert_eq!(first, second);

    let again = document::parse_document(&second).unwrap();
    assert_eq!(again, doc);
}

#[test]
fn rehashing_parsed_entities_reproduces_recorded_hashes() {
    let rec = record_catalogue();
    let doc = document::parse_document(&rec.serialize()).unwrap();

    // Rebuild a recorder from the parsed document and verify each
    // entity's canonical hash matches the hash stored alongside it.
    let mut rebuilt = StateRecorder::new();
    for record in &doc.samplers {
        assert_eq!(canon::sampler_hash(&record.desc), record.hash);
        rebuilt.register_sampler(record.hash, record.desc.clone());
    }
    for record in &doc.set_layouts {
        assert_eq!(
            canon::set_layout_hash(&record.desc, &rebuilt).unwrap(),
            record.hash
        );
        rebuilt.register_set_layout(record.hash, record.desc.clone());
    }
    for record in &doc.pipeline_layouts {
        assert_eq!(
            canon::pipeline_layout_hash(&record.desc, &rebuilt).unwrap(),
            record.hash
        );
        rebuilt.register_pipeline_layout(record.hash, record.desc.clone());
    }
    for record in &doc.shader_modules {
        assert_eq!(canon::shader_module_hash(&record.desc), record.hash);
        rebuilt.register_shader_module(record.hash, record.desc.clone());
    }
    for record in &doc.compute_pipelines {
        assert_eq!(
            canon::compute_pipeline_hash(&record.desc, &rebuilt).unwrap(),
            record.hash
        );
    }
}
