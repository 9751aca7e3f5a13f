//! The per-element texture atlas.
//!
//! Static elements are rasterized once into a single fixed-size RGBA
//! texture; each gets a region allocated by a shelf packer and padded by
//! a small gutter against bilinear bleed. When allocation fails the
//! whole atlas resets and regions re-rasterize lazily on the next
//! frame, which is simpler than LRU and fine for per-canvas workloads.
//!
//! All bookkeeping (packing, versions, staleness) lives in a GL-free
//! index so the invalidation contract is testable without a context;
//! [`TextureAtlas`] adds the texture and the uploads.

use crate::error::RenderError;
use fnv::{FnvHashMap, FnvHashSet};
use glow::HasContext;

/// A caller-rasterized bitmap, tightly packed RGBA8.
#[derive(Clone, Debug)]
pub struct Bitmap {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 4` bytes, row-major.
    pub pixels: Vec<u8>,
}

impl Bitmap {
    fn is_consistent(&self) -> bool {
        self.pixels.len() == (self.width * self.height * 4) as usize
    }
}

/// A normalized region inside the atlas texture.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AtlasRegion {
    /// Left edge in `[0, 1]`.
    pub u: f32,
    /// Top edge in `[0, 1]`.
    pub v: f32,
    /// Width in `[0, 1]`.
    pub u_w: f32,
    /// Height in `[0, 1]`.
    pub v_h: f32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PackedRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// The atlas bookkeeping for one element.
#[derive(Clone, Debug)]
pub struct AtlasEntry {
    /// Where the element's pixels live.
    pub region: AtlasRegion,
    /// Incremented on every (re)rasterization.
    pub version: u64,
    /// Hash of the appearance-affecting element fields at raster time.
    pub fingerprint: u64,
    rect: PackedRect,
}

struct Shelf {
    y: u32,
    height: u32,
    cursor: u32,
}

/// A shelf packer over a square of side `size`: rows grow top-down,
/// items within a row grow left-to-right.
pub(crate) struct ShelfPacker {
    size: u32,
    shelves: Vec<Shelf>,
    next_y: u32,
}

impl ShelfPacker {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            shelves: Vec::new(),
            next_y: 0,
        }
    }

    pub fn allocate(&mut self, w: u32, h: u32) -> Option<PackedRect> {
        if w > self.size || h > self.size {
            return None;
        }
        for shelf in self.shelves.iter_mut() {
            if h <= shelf.height && shelf.cursor + w <= self.size {
                let rect = PackedRect {
                    x: shelf.cursor,
                    y: shelf.y,
                    w,
                    h,
                };
                shelf.cursor += w;
                return Some(rect);
            }
        }
        if self.next_y + h > self.size {
            return None;
        }
        let shelf = Shelf {
            y: self.next_y,
            height: h,
            cursor: w,
        };
        self.next_y += h;
        let rect = PackedRect {
            x: 0,
            y: shelf.y,
            w,
            h,
        };
        self.shelves.push(shelf);
        Some(rect)
    }

    pub fn reset(&mut self) {
        self.shelves.clear();
        self.next_y = 0;
    }
}

/// The GL-free half of the atlas: placement, versions, staleness.
pub(crate) struct AtlasIndex {
    size: u32,
    gutter: u32,
    packer: ShelfPacker,
    entries: FnvHashMap<String, AtlasEntry>,
    stale: FnvHashSet<String>,
}

impl AtlasIndex {
    fn new(size: u32, gutter: u32) -> Self {
        Self {
            size,
            gutter,
            packer: ShelfPacker::new(size),
            entries: FnvHashMap::default(),
            stale: FnvHashSet::default(),
        }
    }

    fn entry(&self, id: &str) -> Option<&AtlasEntry> {
        self.entries.get(id)
    }

    fn is_fresh(&self, id: &str, fingerprint: u64) -> bool {
        !self.stale.contains(id)
            && self
                .entries
                .get(id)
                .map(|entry| entry.fingerprint == fingerprint)
                .unwrap_or(false)
    }

    /// Assigns a region for a bitmap of the given size, reusing the old
    /// region when the size is unchanged, and bumps the entry version.
    fn place(
        &mut self,
        id: &str,
        fingerprint: u64,
        width: u32,
        height: u32,
    ) -> Result<PackedRect, RenderError> {
        let rect = match self.entries.get(id) {
            Some(entry) if entry.rect.w == width && entry.rect.h == height => entry.rect,
            _ => {
                let padded_w = width + 2 * self.gutter;
                let padded_h = height + 2 * self.gutter;
                let padded = self
                    .packer
                    .allocate(padded_w, padded_h)
                    .ok_or(RenderError::AtlasFull(padded_w, padded_h))?;
                PackedRect {
                    x: padded.x + self.gutter,
                    y: padded.y + self.gutter,
                    w: width,
                    h: height,
                }
            }
        };
        let size = self.size as f32;
        let version = self.entries.get(id).map(|e| e.version).unwrap_or(0) + 1;
        let entry = AtlasEntry {
            region: AtlasRegion {
                u: rect.x as f32 / size,
                v: rect.y as f32 / size,
                u_w: rect.w as f32 / size,
                v_h: rect.h as f32 / size,
            },
            version,
            fingerprint,
            rect,
        };
        self.stale.remove(id);
        self.entries.insert(id.to_owned(), entry);
        Ok(rect)
    }

    fn invalidate(&mut self, id: &str) {
        if self.entries.contains_key(id) {
            self.stale.insert(id.to_owned());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.stale.clear();
        self.packer.reset();
    }
}

/// The GPU atlas: one RGBA texture plus the entry index.
pub struct TextureAtlas {
    texture: glow::Texture,
    index: AtlasIndex,
}

impl TextureAtlas {
    /// Allocates the backing texture.
    pub fn new(gl: &glow::Context, size: u32, gutter: u32) -> Result<Self, RenderError> {
        let texture = unsafe {
            let texture = gl
                .create_texture()
                .map_err(|_| RenderError::ObjectCreation("atlas texture"))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                size as i32,
                size as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                None,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::LINEAR as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::LINEAR as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_S,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_WRAP_T,
                glow::CLAMP_TO_EDGE as i32,
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
            texture
        };
        Ok(Self {
            texture,
            index: AtlasIndex::new(size, gutter),
        })
    }

    /// The entry for an element, if one exists.
    pub fn entry(&self, id: &str) -> Option<&AtlasEntry> {
        self.index.entry(id)
    }

    /// True when the element needs no rasterization this frame.
    pub fn is_fresh(&self, id: &str, fingerprint: u64) -> bool {
        self.index.is_fresh(id, fingerprint)
    }

    /// Uploads a freshly rasterized bitmap for an element.
    ///
    /// The previous region is reused when the size is unchanged;
    /// otherwise a new one is allocated. [`RenderError::AtlasFull`]
    /// tells the caller to [`TextureAtlas::reset`] and re-rasterize
    /// lazily.
    pub fn rasterize(
        &mut self,
        gl: &glow::Context,
        id: &str,
        fingerprint: u64,
        bitmap: &Bitmap,
    ) -> Result<&AtlasEntry, RenderError> {
        if !bitmap.is_consistent() {
            return Err(RenderError::BadBitmap(id.to_owned()));
        }
        let rect = self.index.place(id, fingerprint, bitmap.width, bitmap.height)?;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(self.texture));
            gl.tex_sub_image_2d(
                glow::TEXTURE_2D,
                0,
                rect.x as i32,
                rect.y as i32,
                rect.w as i32,
                rect.h as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(&bitmap.pixels),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        Ok(self
            .index
            .entry(id)
            .expect("entry exists right after placement"))
    }

    /// Marks one element stale; the next render re-rasterizes it.
    pub fn invalidate(&mut self, id: &str) {
        self.index.invalidate(id);
    }

    /// Drops every entry; regions rebuild lazily.
    pub fn clear(&mut self) {
        self.index.clear();
    }

    /// Eviction under pressure: same as [`TextureAtlas::clear`], kept
    /// separate for intent at call sites.
    pub fn reset(&mut self) {
        tracing::debug!("atlas full, resetting");
        self.index.clear();
    }

    /// Binds the atlas texture to a unit.
    pub fn bind(&self, gl: &glow::Context, unit: u32) {
        unsafe {
            gl.active_texture(glow::TEXTURE0 + unit);
            gl.bind_texture(glow::TEXTURE_2D, Some(self.texture));
        }
    }

    /// Releases the texture.
    pub fn delete(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_texture(self.texture);
        }
    }
}
