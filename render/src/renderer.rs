//! The hybrid instanced renderer.
//!
//! Static elements are drawn from the atlas as textured quads, one
//! instanced draw call per frame; only the view matrix and the
//! per-instance attributes travel to the GPU each frame. Selected
//! elements are left to the caller's interactive vector overlay, and
//! below the element-count threshold the caller skips the GPU path
//! entirely.

use crate::atlas::{AtlasRegion, Bitmap, TextureAtlas};
use crate::error::RenderError;
use crate::gl::{create_buffer_with, float_attrib, upload_buffer, ShaderProgram};
use crate::instance::{ElementInstance, INSTANCE_STRIDE};
use crate::mat3::Mat3;
use easel::{Element, ElementKind, Viewport};
use fnv::FnvHashSet;
use glow::HasContext;

const VERTEX_GLSL: &str = include_str!("shaders/element.vert");
const FRAGMENT_GLSL: &str = include_str!("shaders/element.frag");

/// Tuning knobs of the renderer.
#[derive(Clone, Copy, Debug)]
pub struct RendererOptions {
    /// Side length of the square atlas texture.
    pub atlas_size: u32,
    /// Padding around each region against bilinear bleed.
    pub gutter: u32,
    /// Minimum element count before the GPU path engages.
    pub element_threshold: usize,
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            atlas_size: 2048,
            gutter: 2,
            element_threshold: 50,
        }
    }
}

/// Hashes the element fields that influence its rasterized pixels.
///
/// Position, rotation and opacity are deliberately absent: they are
/// per-instance attributes, and changing them must not re-rasterize.
pub fn appearance_fingerprint(element: &Element) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    element.kind.type_name().hash(&mut hasher);
    element.width.to_bits().hash(&mut hasher);
    element.height.to_bits().hash(&mut hasher);

    let style = &element.style;
    style.stroke_color.hash(&mut hasher);
    style.fill_color.hash(&mut hasher);
    style.stroke_width.to_bits().hash(&mut hasher);
    style.stroke_style.hash(&mut hasher);
    style.roughness.to_bits().hash(&mut hasher);
    style.font_size.to_bits().hash(&mut hasher);
    style.font_family.hash(&mut hasher);

    let hash_points = |points: &[f64], hasher: &mut std::collections::hash_map::DefaultHasher| {
        for p in points {
            p.to_bits().hash(hasher);
        }
    };
    match &element.kind {
        ElementKind::Rectangle { corner_radius } => corner_radius.to_bits().hash(&mut hasher),
        ElementKind::Ellipse | ElementKind::Diamond => {}
        ElementKind::Line(shape) => {
            hash_points(&shape.points, &mut hasher);
            shape.line_type.hash(&mut hasher);
            shape.curvature.map(f64::to_bits).hash(&mut hasher);
        }
        ElementKind::Arrow {
            shape,
            start_arrowhead,
            end_arrowhead,
        } => {
            hash_points(&shape.points, &mut hasher);
            shape.line_type.hash(&mut hasher);
            shape.curvature.map(f64::to_bits).hash(&mut hasher);
            start_arrowhead.hash(&mut hasher);
            end_arrowhead.hash(&mut hasher);
        }
        ElementKind::Freedraw {
            points, pressures, ..
        } => {
            hash_points(points, &mut hasher);
            if let Some(pressures) = pressures {
                hash_points(pressures, &mut hasher);
            }
        }
        ElementKind::Text {
            text,
            text_align,
            vertical_align,
            ..
        } => {
            text.hash(&mut hasher);
            text_align.hash(&mut hasher);
            vertical_align.hash(&mut hasher);
        }
        ElementKind::Image {
            src,
            scale_mode,
            crop,
            ..
        } => {
            src.hash(&mut hasher);
            scale_mode.hash(&mut hasher);
            if let Some(crop) = crop {
                crop.x.to_bits().hash(&mut hasher);
                crop.y.to_bits().hash(&mut hasher);
                crop.width.to_bits().hash(&mut hasher);
                crop.height.to_bits().hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

/// Builds the per-instance buffer: visible, unselected elements with an
/// atlas region, in the order given (the store keeps it sorted).
pub fn build_instances(
    elements: &[Element],
    selected: &FnvHashSet<&str>,
    mut region_of: impl FnMut(&Element) -> Option<AtlasRegion>,
) -> Vec<ElementInstance> {
    let mut instances = Vec::with_capacity(elements.len());
    for element in elements {
        if !element.is_visible || selected.contains(element.id.as_str()) {
            continue;
        }
        let Some(region) = region_of(element) else {
            continue;
        };
        instances.push(ElementInstance {
            world_rect: [
                element.x as f32,
                element.y as f32,
                element.width as f32,
                element.height as f32,
            ],
            tex_rect: [region.u, region.v, region.u_w, region.v_h],
            opacity: element.style.opacity as f32,
            rotation: element.rotation as f32,
        });
    }
    instances
}

/// Owns the GL context and every GPU resource of the element pipeline.
pub struct HybridRenderer {
    gl: glow::Context,
    program: ShaderProgram,
    vao: glow::VertexArray,
    quad_vbo: glow::Buffer,
    instance_vbo: glow::Buffer,
    atlas: TextureAtlas,
    raster: Box<dyn FnMut(&Element) -> Option<Bitmap>>,
    view_loc: glow::UniformLocation,
    sampler_loc: glow::UniformLocation,
    canvas_size: (u32, u32),
    options: RendererOptions,
    instances: Vec<ElementInstance>,
}

impl HybridRenderer {
    /// Builds the pipeline. Any failure here means "no GPU path": the
    /// caller logs it and stays on vector rendering.
    pub fn new(
        gl: glow::Context,
        options: RendererOptions,
        raster: impl FnMut(&Element) -> Option<Bitmap> + 'static,
    ) -> Result<Self, RenderError> {
        let program = ShaderProgram::create(&gl, VERTEX_GLSL, FRAGMENT_GLSL)?;

        // unit quad in triangle-strip order
        let quad: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let (vao, quad_vbo, instance_vbo) = unsafe {
            let vao = gl
                .create_vertex_array()
                .map_err(|_| RenderError::ObjectCreation("vertex array"))?;
            gl.bind_vertex_array(Some(vao));
            let quad_vbo = create_buffer_with(
                &gl,
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&quad),
                glow::STATIC_DRAW,
            )?;
            float_attrib(&gl, 0, 2, 8, 0, false);

            let instance_vbo =
                create_buffer_with(&gl, glow::ARRAY_BUFFER, &[], glow::DYNAMIC_DRAW)?;
            float_attrib(&gl, 1, 4, INSTANCE_STRIDE, 0, true);
            float_attrib(&gl, 2, 4, INSTANCE_STRIDE, 16, true);
            float_attrib(&gl, 3, 1, INSTANCE_STRIDE, 32, true);
            float_attrib(&gl, 4, 1, INSTANCE_STRIDE, 36, true);
            gl.bind_vertex_array(None);
            (vao, quad_vbo, instance_vbo)
        };

        let (view_loc, sampler_loc) = unsafe {
            let view = gl
                .get_uniform_location(program.program, "u_view")
                .ok_or(RenderError::ObjectCreation("u_view uniform"))?;
            let sampler = gl
                .get_uniform_location(program.program, "u_atlas")
                .ok_or(RenderError::ObjectCreation("u_atlas uniform"))?;
            (view, sampler)
        };

        let atlas = TextureAtlas::new(&gl, options.atlas_size, options.gutter)?;
        Ok(Self {
            gl,
            program,
            vao,
            quad_vbo,
            instance_vbo,
            atlas,
            raster: Box::new(raster),
            view_loc,
            sampler_loc,
            canvas_size: (0, 0),
            options,
            instances: Vec::new(),
        })
    }

    /// Draws one frame. Returns false when the element count is below
    /// the threshold and the caller should vector-render instead.
    pub fn render(
        &mut self,
        elements: &[Element],
        selected_ids: &[String],
        viewport: Viewport,
    ) -> bool {
        let (width, height) = self.canvas_size;
        if elements.len() < self.options.element_threshold || width == 0 || height == 0 {
            return false;
        }
        let selected: FnvHashSet<&str> = selected_ids.iter().map(String::as_str).collect();

        // rasterize everything stale or new before building instances
        for element in elements {
            if !element.is_visible || selected.contains(element.id.as_str()) {
                continue;
            }
            let fingerprint = appearance_fingerprint(element);
            if self.atlas.is_fresh(&element.id, fingerprint) {
                continue;
            }
            let Some(bitmap) = (self.raster)(element) else {
                continue;
            };
            match self.atlas.rasterize(&self.gl, &element.id, fingerprint, &bitmap) {
                Ok(_) => {}
                Err(RenderError::AtlasFull(..)) => {
                    // wipe and retry; everything else re-rasterizes
                    // lazily over the following frames
                    self.atlas.reset();
                    if let Err(err) =
                        self.atlas.rasterize(&self.gl, &element.id, fingerprint, &bitmap)
                    {
                        tracing::warn!("rasterize after atlas reset failed: {}", err);
                    }
                }
                Err(err) => {
                    tracing::debug!("rasterize failed for {}: {}", element.id, err);
                }
            }
        }

        let atlas = &self.atlas;
        let instances = build_instances(elements, &selected, |element| {
            atlas.entry(&element.id).map(|entry| entry.region)
        });
        self.instances = instances;
        if self.instances.is_empty() {
            return true;
        }

        let view = Mat3::view(viewport, width as f32, height as f32);
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
            self.program.bind(&self.gl);
            self.gl.bind_vertex_array(Some(self.vao));
            upload_buffer(
                &self.gl,
                glow::ARRAY_BUFFER,
                self.instance_vbo,
                bytemuck::cast_slice(&self.instances),
                glow::DYNAMIC_DRAW,
            );
            self.gl
                .uniform_matrix_3_f32_slice(Some(&self.view_loc), false, &view.data);
            self.atlas.bind(&self.gl, 0);
            self.gl.uniform_1_i32(Some(&self.sampler_loc), 0);
            self.gl.enable(glow::BLEND);
            self.gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
            self.gl.draw_arrays_instanced(
                glow::TRIANGLE_STRIP,
                0,
                4,
                self.instances.len() as i32,
            );
            self.gl.bind_vertex_array(None);
        }
        true
    }

    /// Marks elements stale; they re-rasterize on the next render.
    pub fn invalidate_elements<S: AsRef<str>>(&mut self, ids: &[S]) {
        for id in ids {
            self.atlas.invalidate(id.as_ref());
        }
    }

    /// Drops the whole atlas; everything re-rasterizes lazily.
    pub fn invalidate_all(&mut self) {
        self.atlas.clear();
    }

    /// Updates the canvas size used for the GL viewport and the view
    /// matrix.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.canvas_size = (width, height);
    }

    /// Read access to the atlas bookkeeping (entry versions, regions).
    pub fn atlas(&self) -> &TextureAtlas {
        &self.atlas
    }

    /// Releases every GPU resource.
    pub fn dispose(self) {
        self.program.delete(&self.gl);
        self.atlas.delete(&self.gl);
        unsafe {
            self.gl.delete_buffer(self.quad_vbo);
            self.gl.delete_buffer(self.instance_vbo);
            self.gl.delete_vertex_array(self.vao);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(id: &str) -> Element {
        let mut e = Element::new(ElementKind::Rectangle { corner_radius: 0.0 })
            .with_rect(0.0, 0.0, 40.0, 30.0);
        e.id = id.to_owned();
        e
    }

    #[test]
    fn fingerprint_ignores_instance_attributes() {
        let a = rect("e1");
        let mut b = a.clone();
        b.x = 500.0;
        b.y = -20.0;
        b.rotation = 1.2;
        b.style.opacity = 0.5;
        assert_eq!(appearance_fingerprint(&a), appearance_fingerprint(&b));
    }

    #[test]
    fn fingerprint_tracks_appearance() {
        let a = rect("e1");
        let mut wider = a.clone();
        wider.width = 80.0;
        assert_ne!(appearance_fingerprint(&a), appearance_fingerprint(&wider));

        let mut recolored = a.clone();
        recolored.style.fill_color = "#00f".to_owned();
        assert_ne!(appearance_fingerprint(&a), appearance_fingerprint(&recolored));

        let mut rounded = a.clone();
        rounded.kind = ElementKind::Rectangle { corner_radius: 12.0 };
        assert_ne!(appearance_fingerprint(&a), appearance_fingerprint(&rounded));
    }

    #[test]
    fn instances_skip_hidden_selected_and_unrasterized() {
        let region = AtlasRegion {
            u: 0.0,
            v: 0.0,
            u_w: 0.5,
            v_h: 0.5,
        };
        let mut hidden = rect("hidden");
        hidden.is_visible = false;
        let elements = vec![rect("a"), hidden, rect("selected"), rect("pending")];
        let selected: FnvHashSet<&str> = ["selected"].into_iter().collect();
        let instances = build_instances(&elements, &selected, |e| {
            (e.id != "pending").then_some(region)
        });
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].world_rect, [0.0, 0.0, 40.0, 30.0]);
        assert_eq!(instances[0].tex_rect, [0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn instances_carry_opacity_and_rotation() {
        let region = AtlasRegion::default();
        let mut e = rect("a");
        e.style.opacity = 0.25;
        e.rotation = std::f64::consts::FRAC_PI_2;
        let instances = build_instances(&[e], &FnvHashSet::default(), |_| Some(region));
        assert_eq!(instances[0].opacity, 0.25);
        assert!((instances[0].rotation - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }
}
