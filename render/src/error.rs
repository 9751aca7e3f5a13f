use thiserror::Error;

/// Everything the GL pipeline can fail with.
///
/// Construction failures make the renderer unavailable; the caller keeps
/// using its vector path. Nothing here is fatal to the host.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A shader stage failed to compile.
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    /// The program failed to link.
    #[error("program link failed: {0}")]
    ProgramLink(String),
    /// A GL object could not be created.
    #[error("gl object creation failed: {0}")]
    ObjectCreation(&'static str),
    /// The atlas has no room for a region of the given size.
    #[error("atlas full: {0}x{1} does not fit")]
    AtlasFull(u32, u32),
    /// A raster bitmap did not match its declared dimensions.
    #[error("bitmap size mismatch for element {0}")]
    BadBitmap(String),
}
