//! Content-addressed registry for recorded pipeline state.
//!
//! The recorder owns one append-only array per entity kind plus a
//! handle-to-index map so the recording layer can translate the driver
//! handles it intercepts into typed [`Ref`]s. Registration order is
//! preserved and duplicates are appended verbatim; deduplication across
//! archives is out of scope.
//!
//! # Invariants
//! - Indices are dense and stable: the index returned by `register_*`
//!   never moves.
//! - Handle maps are installed explicitly via `set_*_handle`; querying a
//!   handle that was never installed is a caller bug surfaced as
//!   [`RecorderError::UnknownHandle`].
//! - Because descriptors can only reference entities that already have
//!   indices, the cross-kind reference graph is acyclic and
//!   topologically ordered by construction.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::errors::RecorderError;
use crate::hasher::Hash;
use crate::state::types::{
    kind, ComputePipelineDesc, GraphicsPipelineDesc, PipelineLayoutDesc, Ref, RenderPassDesc,
    SamplerDesc, SetLayoutDesc, ShaderModuleDesc,
};

/// A registered entity: its content hash plus the recorded descriptor.
///
/// Serializes with the descriptor fields inlined next to `hash`, which
/// is exactly the wire shape of one document array element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub hash: Hash,
    #[serde(flatten)]
    pub desc: T,
}

/// Recording-side registry over the seven entity kinds.
#[derive(Default)]
pub struct StateRecorder {
    samplers: Vec<Record<SamplerDesc>>,
    set_layouts: Vec<Record<SetLayoutDesc>>,
    pipeline_layouts: Vec<Record<PipelineLayoutDesc>>,
    shader_modules: Vec<Record<ShaderModuleDesc>>,
    render_passes: Vec<Record<RenderPassDesc>>,
    compute_pipelines: Vec<Record<ComputePipelineDesc>>,
    graphics_pipelines: Vec<Record<GraphicsPipelineDesc>>,

    sampler_handles: AHashMap<u64, u32>,
    set_layout_handles: AHashMap<u64, u32>,
    pipeline_layout_handles: AHashMap<u64, u32>,
    shader_module_handles: AHashMap<u64, u32>,
    render_pass_handles: AHashMap<u64, u32>,
    compute_pipeline_handles: AHashMap<u64, u32>,
    graphics_pipeline_handles: AHashMap<u64, u32>,
}

macro_rules! registry_ops {
    (
        $kind_name:literal, $desc:ty, $marker:ty,
        $records:ident, $handles:ident,
        $register:ident, $set_handle:ident, $get_hash:ident, $ref_for:ident,
        $accessor:ident, $hash_at:ident
    ) => {
        /// Appends a registered entity, returning its registry index.
        pub fn $register(&mut self, hash: Hash, desc: $desc) -> u32 {
            let index = self.$records.len() as u32;
            self.$records.push(Record { hash, desc });
            index
        }

        /// Installs the reverse mapping from a driver handle to `index`.
        pub fn $set_handle(&mut self, index: u32, handle: u64) {
            self.$handles.insert(handle, index);
        }

        /// Resolves a driver handle to the registered entity's hash.
        pub fn $get_hash(&self, handle: u64) -> Result<Hash, RecorderError> {
            let index = self.$handles.get(&handle).ok_or(RecorderError::UnknownHandle {
                kind: $kind_name,
                handle,
            })?;
            Ok(self.$records[*index as usize].hash)
        }

        /// Resolves a driver handle to a typed reference for use in a
        /// descriptor under construction.
        pub fn $ref_for(&self, handle: u64) -> Result<Ref<$marker>, RecorderError> {
            let index = self.$handles.get(&handle).ok_or(RecorderError::UnknownHandle {
                kind: $kind_name,
                handle,
            })?;
            Ok(Ref::from_index(*index))
        }

        /// Registered entities of this kind, in registration order.
        pub fn $accessor(&self) -> &[Record<$desc>] {
            &self.$records
        }

        /// Hash of the entity at `index`, if registered.
        pub fn $hash_at(&self, index: u32) -> Option<Hash> {
            self.$records.get(index as usize).map(|r| r.hash)
        }
    };
}

impl StateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    registry_ops!(
        "sampler", SamplerDesc, kind::Sampler,
        samplers, sampler_handles,
        register_sampler, set_sampler_handle, get_hash_for_sampler, ref_for_sampler,
        samplers, sampler_hash_at
    );
    registry_ops!(
        "descriptor set layout", SetLayoutDesc, kind::SetLayout,
        set_layouts, set_layout_handles,
        register_set_layout, set_set_layout_handle, get_hash_for_set_layout, ref_for_set_layout,
        set_layouts, set_layout_hash_at
    );
    registry_ops!(
        "pipeline layout", PipelineLayoutDesc, kind::PipelineLayout,
        pipeline_layouts, pipeline_layout_handles,
        register_pipeline_layout, set_pipeline_layout_handle, get_hash_for_pipeline_layout,
        ref_for_pipeline_layout,
        pipeline_layouts, pipeline_layout_hash_at
    );
    registry_ops!(
        "shader module", ShaderModuleDesc, kind::ShaderModule,
        shader_modules, shader_module_handles,
        register_shader_module, set_shader_module_handle, get_hash_for_shader_module,
        ref_for_shader_module,
        shader_modules, shader_module_hash_at
    );
    registry_ops!(
        "render pass", RenderPassDesc, kind::RenderPass,
        render_passes, render_pass_handles,
        register_render_pass, set_render_pass_handle, get_hash_for_render_pass,
        ref_for_render_pass,
        render_passes, render_pass_hash_at
    );
    registry_ops!(
        "compute pipeline", ComputePipelineDesc, kind::ComputePipeline,
        compute_pipelines, compute_pipeline_handles,
        register_compute_pipeline, set_compute_pipeline_handle, get_hash_for_compute_pipeline,
        ref_for_compute_pipeline,
        compute_pipelines, compute_pipeline_hash_at
    );
    registry_ops!(
        "graphics pipeline", GraphicsPipelineDesc, kind::GraphicsPipeline,
        graphics_pipelines, graphics_pipeline_handles,
        register_graphics_pipeline, set_graphics_pipeline_handle, get_hash_for_graphics_pipeline,
        ref_for_graphics_pipeline,
        graphics_pipelines, graphics_pipeline_hash_at
    );

    /// Serializes all seven registries to the text document form.
    pub fn serialize(&self) -> String {
        crate::state::document::serialize_recorder(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> SamplerDesc {
        SamplerDesc {
            flags: 0,
            mag_filter: 1,
            min_filter: 1,
            mipmap_mode: 0,
            address_mode_u: 0,
            address_mode_v: 0,
            address_mode_w: 0,
            mip_lod_bias: 0.0,
            anisotropy_enable: 0,
            max_anisotropy: 1.0,
            compare_enable: 0,
            compare_op: 0,
            min_lod: 0.0,
            max_lod: 1.0,
            border_color: 0,
            unnormalized_coordinates: 0,
        }
    }

    #[test]
    fn register_assigns_dense_indices() {
        let mut rec = StateRecorder::new();
        assert_eq!(rec.register_sampler(10, sampler()), 0);
        assert_eq!(rec.register_sampler(11, sampler()), 1);
        assert_eq!(rec.samplers().len(), 2);
        assert_eq!(rec.sampler_hash_at(1), Some(11));
        assert_eq!(rec.sampler_hash_at(2), None);
    }

    #[test]
    fn handle_resolution() {
        let mut rec = StateRecorder::new();
        let index = rec.register_sampler(42, sampler());
        rec.set_sampler_handle(index, 0xabcd);
        assert_eq!(rec.get_hash_for_sampler(0xabcd).unwrap(), 42);
        assert_eq!(rec.ref_for_sampler(0xabcd).unwrap().index(), Some(0));
        match rec.get_hash_for_sampler(0xffff) {
            Err(RecorderError::UnknownHandle { handle, .. }) => assert_eq!(handle, 0xffff),
            other => panic!("expected UnknownHandle, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_registration_is_appended() {
        let mut rec = StateRecorder::new();
        rec.register_sampler(7, sampler());
        rec.register_sampler(7, sampler());
        assert_eq!(rec.samplers().len(), 2);
    }
}
