//! Canonical hashing of recorded entities.
//!
//! Each function feeds a fixed token order to the [`Hasher`]; that order
//! is the externally observable identity of the entity kind and must
//! never change. The rules:
//!
//! - Aggregate count fields are hashed before their element lists.
//! - A missing optional state block contributes a single `u32(0)`.
//! - Cross-references contribute the referenced entity's hash, never its
//!   registry index, so hashes compose by content.
//! - Values a pipeline declares as dynamic are supplied at draw time and
//!   are excluded, so pipelines differing only in such values hash
//!   identically.
//! - Blend constants participate only when some attachment uses a
//!   constant blend factor and the constants are not dynamic.
//! - Immutable sampler arrays participate only for the sampler-bearing
//!   descriptor types.
//!
//! Base-pipeline handles are opaque pass-through values; when nonzero
//! the raw handle and index are folded in as-is.

use crate::errors::RecorderError;
use crate::hasher::{Hash, Hasher};
use crate::state::recorder::StateRecorder;
use crate::state::types::*;
use crate::vk;

fn resolve<K>(
    reference: Ref<K>,
    kind: &'static str,
    hash_at: impl Fn(u32) -> Option<Hash>,
) -> Result<Hash, RecorderError> {
    let index = reference
        .index()
        .ok_or(RecorderError::UnknownReference { kind, index: 0 })?;
    hash_at(index).ok_or(RecorderError::UnknownReference { kind, index })
}

/// Hash of a sampler: scalar fields in declaration order.
pub fn sampler_hash(desc: &SamplerDesc) -> Hash {
    let mut h = Hasher::new();
    h.u32(desc.flags);
    h.u32(desc.mag_filter);
    h.u32(desc.min_filter);
    h.u32(desc.mipmap_mode);
    h.u32(desc.address_mode_u);
    h.u32(desc.address_mode_v);
    h.u32(desc.address_mode_w);
    h.f32(desc.mip_lod_bias);
    h.u32(desc.anisotropy_enable);
    h.f32(desc.max_anisotropy);
    h.u32(desc.compare_enable);
    h.u32(desc.compare_op);
    h.f32(desc.min_lod);
    h.f32(desc.max_lod);
    h.u32(desc.border_color);
    h.u32(desc.unnormalized_coordinates);
    h.get()
}

/// Hash of a descriptor-set layout.
pub fn set_layout_hash(
    desc: &SetLayoutDesc,
    recorder: &StateRecorder,
) -> Result<Hash, RecorderError> {
    let mut h = Hasher::new();
    h.u32(desc.bindings.len() as u32);
    h.u32(desc.flags);
    for binding in &desc.bindings {
        h.u32(binding.binding);
        h.u32(binding.descriptor_count);
        h.u32(binding.descriptor_type);
        h.u32(binding.stage_flags);

        let sampler_bearing = binding.descriptor_type == vk::DESCRIPTOR_TYPE_SAMPLER
            || binding.descriptor_type == vk::DESCRIPTOR_TYPE_COMBINED_IMAGE_SAMPLER;
        if let (Some(samplers), true) = (&binding.immutable_samplers, sampler_bearing) {
            for sampler in samplers {
                if sampler.is_none() {
                    h.u32(0);
                } else {
                    h.u64(resolve(*sampler, "sampler", |i| recorder.sampler_hash_at(i))?);
                }
            }
        }
    }
    Ok(h.get())
}

/// Hash of a pipeline layout.
pub fn pipeline_layout_hash(
    desc: &PipelineLayoutDesc,
    recorder: &StateRecorder,
) -> Result<Hash, RecorderError> {
    let mut h = Hasher::new();
    h.u32(desc.set_layouts.len() as u32);
    for layout in &desc.set_layouts {
        if layout.is_none() {
            h.u32(0);
        } else {
            h.u64(resolve(*layout, "descriptor set layout", |i| {
                recorder.set_layout_hash_at(i)
            })?);
        }
    }
    h.u32(desc.push_constant_ranges.len() as u32);
    for range in &desc.push_constant_ranges {
        h.u32(range.stage_flags);
        h.u32(range.size);
        h.u32(range.offset);
    }
    h.u32(desc.flags);
    Ok(h.get())
}

/// Hash of a shader module: the code payload then the flags.
pub fn shader_module_hash(desc: &ShaderModuleDesc) -> Hash {
    let mut h = Hasher::new();
    h.data(&desc.code_bytes());
    h.u32(desc.flags);
    h.get()
}

fn hash_specialization(h: &mut Hasher, spec: &SpecializationInfo) {
    h.data(&spec.data);
    h.u32(spec.data.len() as u32);
    h.u32(spec.map_entries.len() as u32);
    for entry in &spec.map_entries {
        h.u32(entry.offset);
        h.u32(entry.size);
        h.u32(entry.constant_id);
    }
}

fn hash_stage(
    h: &mut Hasher,
    stage: &ShaderStage,
    recorder: &StateRecorder,
) -> Result<(), RecorderError> {
    h.u32(stage.flags);
    h.string(&stage.name);
    h.u32(stage.stage);
    h.u64(resolve(stage.module, "shader module", |i| {
        recorder.shader_module_hash_at(i)
    })?);
    match &stage.specialization_info {
        Some(spec) => hash_specialization(h, spec),
        None => h.u32(0),
    }
    Ok(())
}

/// Dynamic-state declarations scanned off a graphics pipeline before
/// hashing its fixed-function blocks.
#[derive(Default)]
struct DynamicMask {
    viewport: bool,
    scissor: bool,
    line_width: bool,
    depth_bias: bool,
    blend_constants: bool,
    depth_bounds: bool,
    stencil_compare: bool,
    stencil_write_mask: bool,
    stencil_reference: bool,
}

impl DynamicMask {
    fn scan(states: &[u32]) -> Self {
        let mut mask = Self::default();
        for &state in states {
            match state {
                vk::DYNAMIC_STATE_VIEWPORT => mask.viewport = true,
                vk::DYNAMIC_STATE_SCISSOR => mask.scissor = true,
                vk::DYNAMIC_STATE_LINE_WIDTH => mask.line_width = true,
                vk::DYNAMIC_STATE_DEPTH_BIAS => mask.depth_bias = true,
                vk::DYNAMIC_STATE_BLEND_CONSTANTS => mask.blend_constants = true,
                vk::DYNAMIC_STATE_DEPTH_BOUNDS => mask.depth_bounds = true,
                vk::DYNAMIC_STATE_STENCIL_COMPARE_MASK => mask.stencil_compare = true,
                vk::DYNAMIC_STATE_STENCIL_WRITE_MASK => mask.stencil_write_mask = true,
                vk::DYNAMIC_STATE_STENCIL_REFERENCE => mask.stencil_reference = true,
                _ => {}
            }
        }
        mask
    }
}

/// Hash of a graphics pipeline.
pub fn graphics_pipeline_hash(
    desc: &GraphicsPipelineDesc,
    recorder: &StateRecorder,
) -> Result<Hash, RecorderError> {
    let mut h = Hasher::new();

    h.u32(desc.flags);

    if desc.base_pipeline_handle != 0 {
        h.u64(desc.base_pipeline_handle);
        h.s32(desc.base_pipeline_index);
    }

    h.u64(resolve(desc.layout, "pipeline layout", |i| {
        recorder.pipeline_layout_hash_at(i)
    })?);
    h.u64(resolve(desc.render_pass, "render pass", |i| {
        recorder.render_pass_hash_at(i)
    })?);
    h.u32(desc.subpass);
    h.u32(desc.stages.len() as u32);

    let dynamic = match &desc.dynamic_state {
        Some(dy) => {
            h.u32(dy.dynamic_state.len() as u32);
            h.u32(dy.flags);
            for &state in &dy.dynamic_state {
                h.u32(state);
            }
            DynamicMask::scan(&dy.dynamic_state)
        }
        None => {
            h.u32(0);
            DynamicMask::default()
        }
    };

    match &desc.depth_stencil_state {
        Some(ds) => {
            h.u32(ds.flags);
            h.u32(ds.depth_bounds_test_enable);
            h.u32(ds.depth_compare_op);
            h.u32(ds.depth_test_enable);
            h.u32(ds.depth_write_enable);
            h.u32(ds.front.compare_op);
            h.u32(ds.front.depth_fail_op);
            h.u32(ds.front.fail_op);
            h.u32(ds.front.pass_op);
            h.u32(ds.back.compare_op);
            h.u32(ds.back.depth_fail_op);
            h.u32(ds.back.fail_op);
            h.u32(ds.back.pass_op);
            h.u32(ds.stencil_test_enable);

            if !dynamic.depth_bounds && ds.depth_bounds_test_enable != 0 {
                h.f32(ds.min_depth_bounds);
                h.f32(ds.max_depth_bounds);
            }

            if ds.stencil_test_enable != 0 {
                if !dynamic.stencil_compare {
                    h.u32(ds.front.compare_mask);
                    h.u32(ds.back.compare_mask);
                }
                if !dynamic.stencil_reference {
                    h.u32(ds.front.reference);
                    h.u32(ds.back.reference);
                }
                if !dynamic.stencil_write_mask {
                    h.u32(ds.front.write_mask);
                    h.u32(ds.back.write_mask);
                }
            }
        }
        None => h.u32(0),
    }

    match &desc.input_assembly_state {
        Some(ia) => {
            h.u32(ia.flags);
            h.u32(ia.primitive_restart_enable);
            h.u32(ia.topology);
        }
        None => h.u32(0),
    }

    match &desc.rasterization_state {
        Some(rs) => {
            h.u32(rs.flags);
            h.u32(rs.cull_mode);
            h.u32(rs.depth_clamp_enable);
            h.u32(rs.front_face);
            h.u32(rs.rasterizer_discard_enable);
            h.u32(rs.polygon_mode);
            h.u32(rs.depth_bias_enable);

            if rs.depth_bias_enable != 0 && !dynamic.depth_bias {
                h.f32(rs.depth_bias_clamp);
                h.f32(rs.depth_bias_slope_factor);
                h.f32(rs.depth_bias_constant_factor);
            }

            if !dynamic.line_width {
                h.f32(rs.line_width);
            }
        }
        None => h.u32(0),
    }

    match &desc.multisample_state {
        Some(ms) => {
            h.u32(ms.flags);
            h.u32(ms.alpha_to_coverage_enable);
            h.u32(ms.alpha_to_one_enable);
            h.f32(ms.min_sample_shading);
            h.u32(ms.rasterization_samples);
            h.u32(ms.sample_shading_enable);
            match &ms.sample_mask {
                Some(mask) => {
                    let words = ms.rasterization_samples.div_ceil(32);
                    for i in 0..words {
                        h.u32(mask.get(i as usize).copied().unwrap_or(0));
                    }
                }
                None => h.u32(0),
            }
        }
        None => h.u32(0),
    }

    match &desc.viewport_state {
        Some(vp) => {
            h.u32(vp.flags);
            h.u32(vp.scissor_count);
            h.u32(vp.viewport_count);
            if !dynamic.scissor {
                if let Some(scissors) = &vp.scissors {
                    for scissor in scissors.iter().take(vp.scissor_count as usize) {
                        h.s32(scissor.x);
                        h.s32(scissor.y);
                        h.u32(scissor.width);
                        h.u32(scissor.height);
                    }
                }
            }
            if !dynamic.viewport {
                if let Some(viewports) = &vp.viewports {
                    for viewport in viewports.iter().take(vp.viewport_count as usize) {
                        h.f32(viewport.x);
                        h.f32(viewport.y);
                        h.f32(viewport.width);
                        h.f32(viewport.height);
                        h.f32(viewport.min_depth);
                        h.f32(viewport.max_depth);
                    }
                }
            }
        }
        None => h.u32(0),
    }

    match &desc.vertex_input_state {
        Some(vi) => {
            h.u32(vi.flags);
            h.u32(vi.attributes.len() as u32);
            h.u32(vi.bindings.len() as u32);
            for attr in &vi.attributes {
                h.u32(attr.offset);
                h.u32(attr.binding);
                h.u32(attr.format);
                h.u32(attr.location);
            }
            for binding in &vi.bindings {
                h.u32(binding.binding);
                h.u32(binding.input_rate);
                h.u32(binding.stride);
            }
        }
        None => h.u32(0),
    }

    match &desc.color_blend_state {
        Some(cb) => {
            h.u32(cb.flags);
            h.u32(cb.attachments.len() as u32);
            h.u32(cb.logic_op_enable);
            h.u32(cb.logic_op);

            let mut need_blend_constants = false;
            for att in &cb.attachments {
                h.u32(att.blend_enable);
                if att.blend_enable != 0 {
                    h.u32(att.color_write_mask);
                    h.u32(att.alpha_blend_op);
                    h.u32(att.color_blend_op);
                    h.u32(att.dst_alpha_blend_factor);
                    h.u32(att.src_alpha_blend_factor);
                    h.u32(att.dst_color_blend_factor);
                    h.u32(att.src_color_blend_factor);

                    if vk::blend_factor_uses_constants(att.dst_alpha_blend_factor)
                        || vk::blend_factor_uses_constants(att.src_alpha_blend_factor)
                        || vk::blend_factor_uses_constants(att.dst_color_blend_factor)
                        || vk::blend_factor_uses_constants(att.src_color_blend_factor)
                    {
                        need_blend_constants = true;
                    }
                } else {
                    h.u32(0);
                }
            }

            if need_blend_constants && !dynamic.blend_constants {
                for constant in cb.blend_constants {
                    h.f32(constant);
                }
            }
        }
        None => h.u32(0),
    }

    match &desc.tessellation_state {
        Some(tess) => {
            h.u32(tess.flags);
            h.u32(tess.patch_control_points);
        }
        None => h.u32(0),
    }

    for stage in &desc.stages {
        hash_stage(&mut h, stage, recorder)?;
    }

    Ok(h.get())
}

/// Hash of a compute pipeline.
pub fn compute_pipeline_hash(
    desc: &ComputePipelineDesc,
    recorder: &StateRecorder,
) -> Result<Hash, RecorderError> {
    let mut h = Hasher::new();

    h.u64(resolve(desc.layout, "pipeline layout", |i| {
        recorder.pipeline_layout_hash_at(i)
    })?);
    h.u32(desc.flags);

    if desc.base_pipeline_handle != 0 {
        h.u64(desc.base_pipeline_handle);
        h.s32(desc.base_pipeline_index);
    } else {
        h.u32(0);
    }

    h.u64(resolve(desc.stage.module, "shader module", |i| {
        recorder.shader_module_hash_at(i)
    })?);
    h.string(&desc.stage.name);
    h.u32(desc.stage.flags);
    h.u32(desc.stage.stage);

    match &desc.stage.specialization_info {
        Some(spec) => hash_specialization(&mut h, spec),
        None => h.u32(0),
    }

    Ok(h.get())
}

fn hash_attachment(h: &mut Hasher, att: &AttachmentDescription) {
    h.u32(att.flags);
    h.u32(att.initial_layout);
    h.u32(att.final_layout);
    h.u32(att.format);
    h.u32(att.load_op);
    h.u32(att.store_op);
    h.u32(att.stencil_load_op);
    h.u32(att.stencil_store_op);
    h.u32(att.samples);
}

fn hash_dependency(h: &mut Hasher, dep: &SubpassDependency) {
    h.u32(dep.dependency_flags);
    h.u32(dep.dst_access_mask);
    h.u32(dep.src_access_mask);
    h.u32(dep.src_subpass);
    h.u32(dep.dst_subpass);
    h.u32(dep.src_stage_mask);
    h.u32(dep.dst_stage_mask);
}

fn hash_subpass(h: &mut Hasher, subpass: &SubpassDescription) {
    h.u32(subpass.flags);
    h.u32(subpass.color_attachments.len() as u32);
    h.u32(subpass.input_attachments.len() as u32);
    h.u32(subpass.preserve_attachments.len() as u32);
    h.u32(subpass.pipeline_bind_point);

    for &preserve in &subpass.preserve_attachments {
        h.u32(preserve);
    }
    for color in &subpass.color_attachments {
        h.u32(color.attachment);
        h.u32(color.layout);
    }
    for input in &subpass.input_attachments {
        h.u32(input.attachment);
        h.u32(input.layout);
    }
    if let Some(resolves) = &subpass.resolve_attachments {
        for resolve in resolves {
            h.u32(resolve.attachment);
            h.u32(resolve.layout);
        }
    }
    match &subpass.depth_stencil_attachment {
        Some(ds) => {
            h.u32(ds.attachment);
            h.u32(ds.layout);
        }
        None => h.u32(0),
    }
}

/// Hash of a render pass.
pub fn render_pass_hash(desc: &RenderPassDesc) -> Hash {
    let mut h = Hasher::new();

    h.u32(desc.attachments.len() as u32);
    h.u32(desc.dependencies.len() as u32);
    h.u32(desc.subpasses.len() as u32);

    for att in &desc.attachments {
        hash_attachment(&mut h, att);
    }
    for dep in &desc.dependencies {
        hash_dependency(&mut h, dep);
    }
    for subpass in &desc.subpasses {
        hash_subpass(&mut h, subpass);
    }

    h.get()
}
