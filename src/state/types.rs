//! Value model for the seven recorded pipeline-state entity kinds.
//!
//! Entities are immutable once registered and identified by a 64-bit
//! content hash. Cross-references between kinds are typed indices
//! ([`Ref`]) into the per-kind registry arrays rather than driver
//! handles, which keeps the reference graph explicit and the wire
//! encoding trivial: a `Ref` serializes as a 1-based integer where `0`
//! is the null reference.
//!
//! The reference graph is a DAG by construction: samplers < set layouts
//! < pipeline layouts; shader modules < pipelines; render passes <
//! graphics pipelines. Registration order enforces this, so every
//! non-null reference points at a strictly lower index of its kind.
//!
//! Serde derives here define the document schema directly; field names
//! are the camelCase keys of the serialized form. The two payload-bearing
//! types (shader module code, specialization data) carry hand-written
//! serde impls because their Base64 wire shape splits one logical field
//! into `codeSize`/`dataSize` plus an encoded string.

use std::fmt;
use std::marker::PhantomData;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// Typed references
// ============================================================================

/// Marker types for the seven registry kinds.
pub mod kind {
    #[derive(Debug)]
    pub enum Sampler {}
    #[derive(Debug)]
    pub enum SetLayout {}
    #[derive(Debug)]
    pub enum PipelineLayout {}
    #[derive(Debug)]
    pub enum ShaderModule {}
    #[derive(Debug)]
    pub enum RenderPass {}
    #[derive(Debug)]
    pub enum GraphicsPipeline {}
    #[derive(Debug)]
    pub enum ComputePipeline {}
}

/// Typed reference into a registry array.
///
/// The raw value is 1-based: `0` is the null reference and `n > 0`
/// refers to registry slot `n - 1` of kind `K`. This matches the
/// serialized form exactly, so no remapping happens at the wire
/// boundary.
pub struct Ref<K> {
    raw: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Ref<K> {
    /// The null reference.
    pub const NONE: Self = Self {
        raw: 0,
        _kind: PhantomData,
    };

    /// Reference to registry slot `index`.
    pub fn from_index(index: u32) -> Self {
        Self {
            raw: index + 1,
            _kind: PhantomData,
        }
    }

    /// Reconstructs a reference from its raw 1-based wire value.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// The 0-based registry index, or `None` for the null reference.
    #[inline]
    pub fn index(self) -> Option<u32> {
        self.raw.checked_sub(1)
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.raw == 0
    }

    /// The 1-based wire value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.raw
    }
}

// Manual impls: derives would demand bounds on the phantom kind.
impl<K> Clone for Ref<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for Ref<K> {}
impl<K> PartialEq for Ref<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<K> Eq for Ref<K> {}
impl<K> fmt::Debug for Ref<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(i) => write!(f, "Ref({i})"),
            None => write!(f, "Ref(null)"),
        }
    }
}

impl<K> Serialize for Ref<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.raw)
    }
}

impl<'de, K> Deserialize<'de> for Ref<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_raw)
    }
}

// ============================================================================
// Samplers and descriptor-set layouts
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerDesc {
    pub flags: u32,
    pub mag_filter: u32,
    pub min_filter: u32,
    pub mipmap_mode: u32,
    pub address_mode_u: u32,
    pub address_mode_v: u32,
    pub address_mode_w: u32,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: u32,
    pub max_anisotropy: f32,
    pub compare_enable: u32,
    pub compare_op: u32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: u32,
    pub unnormalized_coordinates: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: u32,
    pub descriptor_count: u32,
    pub stage_flags: u32,
    /// Present iff the recording saw immutable samplers on this binding.
    /// Length equals `descriptor_count`. Only meaningful for sampler-
    /// bearing descriptor types; ignored by hashing otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immutable_samplers: Option<Vec<Ref<kind::Sampler>>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLayoutDesc {
    pub flags: u32,
    #[serde(default)]
    pub bindings: Vec<SetLayoutBinding>,
}

// ============================================================================
// Pipeline layouts
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConstantRange {
    pub stage_flags: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLayoutDesc {
    pub flags: u32,
    #[serde(default)]
    pub set_layouts: Vec<Ref<kind::SetLayout>>,
    #[serde(default)]
    pub push_constant_ranges: Vec<PushConstantRange>,
}

// ============================================================================
// Shader modules
// ============================================================================

/// Compiled shader bytecode container.
///
/// `code_size` is the payload length in bytes and is carried separately
/// from the word vector because the wire format encodes the payload as
/// Base64 of exactly that many bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderModuleDesc {
    pub flags: u32,
    pub code: Vec<u32>,
    pub code_size: u64,
}

impl ShaderModuleDesc {
    /// Builds a module descriptor from its code words; `code_size` is the
    /// full byte length of the slice.
    pub fn from_words(flags: u32, code: Vec<u32>) -> Self {
        let code_size = (code.len() * 4) as u64;
        Self {
            flags,
            code,
            code_size,
        }
    }

    /// The first `code_size` bytes of the payload, little-endian words.
    pub fn code_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.code.len() * 4);
        for word in &self.code {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(self.code_size as usize);
        bytes
    }
}

fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    let mut words = Vec::with_capacity(bytes.len().div_ceil(4));
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        words.push(u32::from_le_bytes(word));
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; 4];
        word[..tail.len()].copy_from_slice(tail);
        words.push(u32::from_le_bytes(word));
    }
    words
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShaderModuleWire {
    flags: u32,
    code_size: u64,
    code: String,
}

impl Serialize for ShaderModuleDesc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ShaderModuleWire {
            flags: self.flags,
            code_size: self.code_size,
            code: BASE64.encode(self.code_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShaderModuleDesc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ShaderModuleWire::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(wire.code.as_bytes())
            .map_err(|e| D::Error::custom(format!("shader module code: {e}")))?;
        if bytes.len() as u64 != wire.code_size {
            return Err(D::Error::custom(format!(
                "shader module codeSize {} != decoded length {}",
                wire.code_size,
                bytes.len()
            )));
        }
        Ok(Self {
            flags: wire.flags,
            code: words_from_bytes(&bytes),
            code_size: wire.code_size,
        })
    }
}

// ============================================================================
// Render passes
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescription {
    pub flags: u32,
    pub format: u32,
    pub samples: u32,
    pub load_op: u32,
    pub store_op: u32,
    pub stencil_load_op: u32,
    pub stencil_store_op: u32,
    pub initial_layout: u32,
    pub final_layout: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: u32,
    pub dst_stage_mask: u32,
    pub src_access_mask: u32,
    pub dst_access_mask: u32,
    pub dependency_flags: u32,
}

/// Reference into the parent render pass's attachment list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: u32,
}

/// Wire form of the always-present depth-stencil slot: an absent
/// attachment is written as `{"attachment": -1, "layout": 0}`.
mod depth_stencil_wire {
    use serde::de::Error as _;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wire {
        attachment: i64,
        layout: u32,
    }

    pub fn serialize<S: Serializer>(
        value: &Option<AttachmentReference>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wire = match value {
            Some(att) => Wire {
                attachment: i64::from(att.attachment),
                layout: att.layout,
            },
            None => Wire {
                attachment: -1,
                layout: crate::vk::IMAGE_LAYOUT_UNDEFINED,
            },
        };
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<AttachmentReference>, D::Error> {
        let wire = Wire::deserialize(deserializer)?;
        if wire.attachment < 0 {
            return Ok(None);
        }
        let attachment = u32::try_from(wire.attachment)
            .map_err(|_| D::Error::custom("depth-stencil attachment out of range"))?;
        Ok(Some(AttachmentReference {
            attachment,
            layout: wire.layout,
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubpassDescription {
    pub flags: u32,
    pub pipeline_bind_point: u32,
    #[serde(default)]
    pub input_attachments: Vec<AttachmentReference>,
    #[serde(default)]
    pub color_attachments: Vec<AttachmentReference>,
    /// Present iff recorded; same length as `color_attachments`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_attachments: Option<Vec<AttachmentReference>>,
    #[serde(default, with = "depth_stencil_wire")]
    pub depth_stencil_attachment: Option<AttachmentReference>,
    #[serde(default)]
    pub preserve_attachments: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPassDesc {
    pub flags: u32,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescription>,
    #[serde(default)]
    pub dependencies: Vec<SubpassDependency>,
    #[serde(default)]
    pub subpasses: Vec<SubpassDescription>,
}

// ============================================================================
// Pipeline stages and specialization
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecMapEntry {
    pub constant_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// Specialization payload attached to a shader stage.
#[derive(Clone, Debug, PartialEq)]
pub struct SpecializationInfo {
    pub data: Vec<u8>,
    pub map_entries: Vec<SpecMapEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecializationWire {
    data_size: u64,
    code: String,
    #[serde(default)]
    map_entries: Vec<SpecMapEntry>,
}

impl Serialize for SpecializationInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SpecializationWire {
            data_size: self.data.len() as u64,
            code: BASE64.encode(&self.data),
            map_entries: self.map_entries.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SpecializationInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = SpecializationWire::deserialize(deserializer)?;
        let data = BASE64
            .decode(wire.code.as_bytes())
            .map_err(|e| D::Error::custom(format!("specialization data: {e}")))?;
        if data.len() as u64 != wire.data_size {
            return Err(D::Error::custom(format!(
                "specialization dataSize {} != decoded length {}",
                wire.data_size,
                data.len()
            )));
        }
        Ok(Self {
            data,
            map_entries: wire.map_entries,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderStage {
    pub flags: u32,
    pub stage: u32,
    pub module: Ref<kind::ShaderModule>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialization_info: Option<SpecializationInfo>,
}

// ============================================================================
// Graphics fixed-function state blocks
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexInputState {
    pub flags: u32,
    #[serde(default)]
    pub attributes: Vec<VertexAttribute>,
    #[serde(default)]
    pub bindings: Vec<VertexBinding>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAssemblyState {
    pub flags: u32,
    pub topology: u32,
    pub primitive_restart_enable: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TessellationState {
    pub flags: u32,
    pub patch_control_points: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Viewport state. Counts are carried explicitly because a pipeline with
/// dynamic viewports records a count but no rectangles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportState {
    pub flags: u32,
    pub viewport_count: u32,
    pub scissor_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewports: Option<Vec<Viewport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scissors: Option<Vec<Rect2D>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterizationState {
    pub flags: u32,
    pub depth_clamp_enable: u32,
    pub rasterizer_discard_enable: u32,
    pub polygon_mode: u32,
    pub cull_mode: u32,
    pub front_face: u32,
    pub depth_bias_enable: u32,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultisampleState {
    pub flags: u32,
    pub rasterization_samples: u32,
    pub sample_shading_enable: u32,
    pub min_sample_shading: f32,
    /// `ceil(rasterization_samples / 32)` words when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_mask: Option<Vec<u32>>,
    pub alpha_to_coverage_enable: u32,
    pub alpha_to_one_enable: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StencilOpState {
    pub fail_op: u32,
    pub pass_op: u32,
    pub depth_fail_op: u32,
    pub compare_op: u32,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthStencilState {
    pub flags: u32,
    pub depth_test_enable: u32,
    pub depth_write_enable: u32,
    pub depth_compare_op: u32,
    pub depth_bounds_test_enable: u32,
    pub stencil_test_enable: u32,
    pub front: StencilOpState,
    pub back: StencilOpState,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorBlendAttachment {
    pub blend_enable: u32,
    pub src_color_blend_factor: u32,
    pub dst_color_blend_factor: u32,
    pub color_blend_op: u32,
    pub src_alpha_blend_factor: u32,
    pub dst_alpha_blend_factor: u32,
    pub alpha_blend_op: u32,
    pub color_write_mask: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorBlendState {
    pub flags: u32,
    pub logic_op_enable: u32,
    pub logic_op: u32,
    #[serde(default)]
    pub attachments: Vec<ColorBlendAttachment>,
    pub blend_constants: [f32; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicStateBlock {
    pub flags: u32,
    #[serde(default)]
    pub dynamic_state: Vec<u32>,
}

// ============================================================================
// Pipelines
// ============================================================================

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphicsPipelineDesc {
    pub flags: u32,
    /// Raw pass-through of the recorded base-pipeline handle; opaque to
    /// this tool and hashed only when nonzero.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub base_pipeline_handle: u64,
    #[serde(default)]
    pub base_pipeline_index: i32,
    pub layout: Ref<kind::PipelineLayout>,
    pub render_pass: Ref<kind::RenderPass>,
    pub subpass: u32,
    #[serde(default)]
    pub stages: Vec<ShaderStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_input_state: Option<VertexInputState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_assembly_state: Option<InputAssemblyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tessellation_state: Option<TessellationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_state: Option<ViewportState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rasterization_state: Option<RasterizationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisample_state: Option<MultisampleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_stencil_state: Option<DepthStencilState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_blend_state: Option<ColorBlendState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_state: Option<DynamicStateBlock>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputePipelineDesc {
    pub flags: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub base_pipeline_handle: u64,
    #[serde(default)]
    pub base_pipeline_index: i32,
    pub layout: Ref<kind::PipelineLayout>,
    pub stage: ShaderStage,
}
