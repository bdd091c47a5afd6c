//! Raw graphics-API constants the core logic inspects.
//!
//! Recorded state carries most enum-valued fields as opaque `u32`s; only
//! the values below influence hashing or replay decisions, so only they
//! get names. Values match the API's C headers and are load-bearing for
//! hash stability; never renumber.

/// Descriptor types whose bindings may carry immutable sampler references.
pub const DESCRIPTOR_TYPE_SAMPLER: u32 = 0;
pub const DESCRIPTOR_TYPE_COMBINED_IMAGE_SAMPLER: u32 = 1;

/// Dynamic-state identifiers. A pipeline that declares one of these
/// supplies the corresponding value at draw time, so the baked value is
/// excluded from the pipeline's identity hash.
pub const DYNAMIC_STATE_VIEWPORT: u32 = 0;
pub const DYNAMIC_STATE_SCISSOR: u32 = 1;
pub const DYNAMIC_STATE_LINE_WIDTH: u32 = 2;
pub const DYNAMIC_STATE_DEPTH_BIAS: u32 = 3;
pub const DYNAMIC_STATE_BLEND_CONSTANTS: u32 = 4;
pub const DYNAMIC_STATE_DEPTH_BOUNDS: u32 = 5;
pub const DYNAMIC_STATE_STENCIL_COMPARE_MASK: u32 = 6;
pub const DYNAMIC_STATE_STENCIL_WRITE_MASK: u32 = 7;
pub const DYNAMIC_STATE_STENCIL_REFERENCE: u32 = 8;

/// Blend factors that read the pipeline's blend-constant vector.
pub const BLEND_FACTOR_CONSTANT_COLOR: u32 = 10;
pub const BLEND_FACTOR_CONSTANT_ALPHA: u32 = 12;

/// Returns true when `factor` sources the blend-constant vector, making
/// the baked constants part of the pipeline's identity.
#[inline]
pub fn blend_factor_uses_constants(factor: u32) -> bool {
    factor == BLEND_FACTOR_CONSTANT_COLOR || factor == BLEND_FACTOR_CONSTANT_ALPHA
}

/// Image layout used for the absent depth-stencil attachment sentinel.
pub const IMAGE_LAYOUT_UNDEFINED: u32 = 0;

/// Pipeline bind points carried by subpass descriptions.
pub const PIPELINE_BIND_POINT_GRAPHICS: u32 = 0;
pub const PIPELINE_BIND_POINT_COMPUTE: u32 = 1;

// Shader stage bits; used by tests and fixtures, carried as flags at
// runtime.
pub const SHADER_STAGE_VERTEX: u32 = 0x1;
pub const SHADER_STAGE_FRAGMENT: u32 = 0x10;
pub const SHADER_STAGE_COMPUTE: u32 = 0x20;
