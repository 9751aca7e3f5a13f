use bytemuck::{Pod, Zeroable};

/// Per-instance vertex attributes for one element quad.
///
/// # Memory layout
/// `#[repr(C)]`, 40 bytes, uploaded verbatim as the instance buffer:
/// - bytes 0..16: world rect `(x, y, w, h)`
/// - bytes 16..32: atlas rect `(u, v, uw, vh)`, normalized
/// - bytes 32..36: opacity
/// - bytes 36..40: rotation, radians
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ElementInstance {
    /// World-space rectangle `(x, y, w, h)`.
    pub world_rect: [f32; 4],
    /// Atlas region `(u, v, uw, vh)` in `[0, 1]`.
    pub tex_rect: [f32; 4],
    /// Multiplied into the sampled color.
    pub opacity: f32,
    /// Rotation around the rectangle center.
    pub rotation: f32,
}

/// Byte stride of one instance.
pub const INSTANCE_STRIDE: i32 = std::mem::size_of::<ElementInstance>() as i32;
