//! # easel-render
//!
//! The GPU half of the canvas: a texture-atlas-backed instanced
//! renderer for static elements. Elements are rasterized once by a
//! caller-supplied raster function, packed into a single atlas texture,
//! and drawn as rotated textured quads in one instanced call per frame.
//! Mutated elements re-rasterize at most once per change, keyed by an
//! appearance fingerprint.
//!
//! Everything GL-independent (the packer, the instance layout, the view
//! matrix, the fingerprint) is exposed for testing without a context.
#![warn(missing_docs)]
mod atlas;
mod error;
mod gl;
mod instance;
mod mat3;
mod renderer;

pub use crate::atlas::{AtlasEntry, AtlasRegion, Bitmap, TextureAtlas};
pub use crate::error::RenderError;
pub use crate::gl::ShaderProgram;
pub use crate::instance::{ElementInstance, INSTANCE_STRIDE};
pub use crate::mat3::Mat3;
pub use crate::renderer::{
    appearance_fingerprint, build_instances, HybridRenderer, RendererOptions,
};
