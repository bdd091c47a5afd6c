//! Shared fixture builders for state-model unit tests.

use crate::state::canon;
use crate::state::recorder::StateRecorder;
use crate::state::types::*;

pub fn sampler() -> SamplerDesc {
    SamplerDesc {
        flags: 0,
        mag_filter: 1,
        min_filter: 1,
        mipmap_mode: 1,
        address_mode_u: 0,
        address_mode_v: 1,
        address_mode_w: 2,
        mip_lod_bias: 0.0,
        anisotropy_enable: 0,
        max_anisotropy: 1.0,
        compare_enable: 0,
        compare_op: 0,
        min_lod: 0.0,
        max_lod: 8.0,
        border_color: 0,
        unnormalized_coordinates: 0,
    }
}

pub fn set_layout_with_immutable(sampler: Ref<kind::Sampler>) -> SetLayoutDesc {
    SetLayoutDesc {
        flags: 0,
        bindings: vec![SetLayoutBinding {
            binding: 0,
            descriptor_type: crate::vk::DESCRIPTOR_TYPE_COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: crate::vk::SHADER_STAGE_FRAGMENT,
            immutable_samplers: Some(vec![sampler]),
        }],
    }
}

pub fn shader_module() -> ShaderModuleDesc {
    ShaderModuleDesc::from_words(0, vec![0x0723_0203, 0x0001_0000, 42, 7])
}

pub fn render_pass() -> RenderPassDesc {
    RenderPassDesc {
        flags: 0,
        attachments: vec![AttachmentDescription {
            flags: 0,
            format: 44,
            samples: 1,
            load_op: 1,
            store_op: 0,
            stencil_load_op: 2,
            stencil_store_op: 1,
            initial_layout: 0,
            final_layout: 2,
        }],
        dependencies: vec![SubpassDependency {
            src_subpass: !0,
            dst_subpass: 0,
            src_stage_mask: 0x400,
            dst_stage_mask: 0x400,
            src_access_mask: 0,
            dst_access_mask: 0x100,
            dependency_flags: 0,
        }],
        subpasses: vec![SubpassDescription {
            flags: 0,
            pipeline_bind_point: crate::vk::PIPELINE_BIND_POINT_GRAPHICS,
            input_attachments: Vec::new(),
            color_attachments: vec![AttachmentReference {
                attachment: 0,
                layout: 2,
            }],
            resolve_attachments: None,
            depth_stencil_attachment: None,
            preserve_attachments: Vec::new(),
        }],
    }
}

/// Recorder pre-seeded with one pipeline layout, one render pass, and one
/// shader module, all at index 0, so pipeline fixtures can reference them.
pub fn recorder_with_layout_and_pass() -> StateRecorder {
    let mut rec = StateRecorder::new();

    let layout = PipelineLayoutDesc {
        flags: 0,
        set_layouts: Vec::new(),
        push_constant_ranges: Vec::new(),
    };
    let layout_hash = canon::pipeline_layout_hash(&layout, &rec).unwrap();
    rec.register_pipeline_layout(layout_hash, layout);

    let pass = render_pass();
    rec.register_render_pass(canon::render_pass_hash(&pass), pass);

    let module = shader_module();
    rec.register_shader_module(canon::shader_module_hash(&module), module);

    rec
}

/// Fully populated graphics pipeline referencing the entities seeded by
/// [`recorder_with_layout_and_pass`].
pub fn graphics_pipeline() -> GraphicsPipelineDesc {
    GraphicsPipelineDesc {
        flags: 0,
        base_pipeline_handle: 0,
        base_pipeline_index: 0,
        layout: Ref::from_index(0),
        render_pass: Ref::from_index(0),
        subpass: 0,
        stages: vec![ShaderStage {
            flags: 0,
            stage: crate::vk::SHADER_STAGE_VERTEX,
            module: Ref::from_index(0),
            name: "main".to_owned(),
            specialization_info: None,
        }],
        vertex_input_state: Some(VertexInputState {
            flags: 0,
            attributes: vec![VertexAttribute {
                location: 0,
                binding: 0,
                format: 106,
                offset: 0,
            }],
            bindings: vec![VertexBinding {
                binding: 0,
                stride: 16,
                input_rate: 0,
            }],
        }),
        input_assembly_state: Some(InputAssemblyState {
            flags: 0,
            topology: 3,
            primitive_restart_enable: 0,
        }),
        tessellation_state: None,
        viewport_state: Some(ViewportState {
            flags: 0,
            viewport_count: 1,
            scissor_count: 1,
            viewports: Some(vec![Viewport {
                x: 0.0,
                y: 0.0,
                width: 1280.0,
                height: 720.0,
                min_depth: 0.0,
                max_depth: 1.0,
            }]),
            scissors: Some(vec![Rect2D {
                x: 0,
                y: 0,
                width: 1280,
                height: 720,
            }]),
        }),
        rasterization_state: Some(RasterizationState {
            flags: 0,
            depth_clamp_enable: 0,
            rasterizer_discard_enable: 0,
            polygon_mode: 0,
            cull_mode: 2,
            front_face: 1,
            depth_bias_enable: 0,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
        }),
        multisample_state: Some(MultisampleState {
            flags: 0,
            rasterization_samples: 1,
            sample_shading_enable: 0,
            min_sample_shading: 0.0,
            sample_mask: None,
            alpha_to_coverage_enable: 0,
            alpha_to_one_enable: 0,
        }),
        depth_stencil_state: Some(DepthStencilState {
            flags: 0,
            depth_test_enable: 1,
            depth_write_enable: 1,
            depth_compare_op: 1,
            depth_bounds_test_enable: 0,
            stencil_test_enable: 0,
            front: StencilOpState {
                fail_op: 0,
                pass_op: 0,
                depth_fail_op: 0,
                compare_op: 7,
                compare_mask: !0,
                write_mask: !0,
                reference: 0,
            },
            back: StencilOpState {
                fail_op: 0,
                pass_op: 0,
                depth_fail_op: 0,
                compare_op: 7,
                compare_mask: !0,
                write_mask: !0,
                reference: 0,
            },
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
        }),
        color_blend_state: Some(ColorBlendState {
            flags: 0,
            logic_op_enable: 0,
            logic_op: 0,
            attachments: vec![ColorBlendAttachment {
                blend_enable: 0,
                src_color_blend_factor: 1,
                dst_color_blend_factor: 0,
                color_blend_op: 0,
                src_alpha_blend_factor: 1,
                dst_alpha_blend_factor: 0,
                alpha_blend_op: 0,
                color_write_mask: 0xf,
            }],
            blend_constants: [0.0; 4],
        }),
        dynamic_state: None,
    }
}

/// Compute pipeline referencing layout 0 and module 0.
pub fn compute_pipeline() -> ComputePipelineDesc {
    ComputePipelineDesc {
        flags: 0,
        base_pipeline_handle: 0,
        base_pipeline_index: 0,
        layout: Ref::from_index(0),
        stage: ShaderStage {
            flags: 0,
            stage: crate::vk::SHADER_STAGE_COMPUTE,
            module: Ref::from_index(0),
            name: "main".to_owned(),
            specialization_info: None,
        },
    }
}
