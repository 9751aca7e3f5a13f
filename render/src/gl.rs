//! Thin glow helpers: shader compilation, buffers, attribute setup.
//!
//! Every GL object created here has a matching delete; the renderer owns
//! them exclusively and releases them in `dispose`.

use crate::error::RenderError;
use glow::HasContext;

/// A compiled and linked shader program.
pub struct ShaderProgram {
    /// The linked program handle.
    pub program: glow::Program,
}

impl ShaderProgram {
    /// Compiles both stages and links them, surfacing the info log on
    /// failure.
    pub fn create(
        gl: &glow::Context,
        vertex_src: &str,
        fragment_src: &str,
    ) -> Result<Self, RenderError> {
        unsafe {
            let vertex = compile(gl, glow::VERTEX_SHADER, vertex_src)?;
            let fragment = match compile(gl, glow::FRAGMENT_SHADER, fragment_src) {
                Ok(shader) => shader,
                Err(err) => {
                    gl.delete_shader(vertex);
                    return Err(err);
                }
            };
            let program = gl
                .create_program()
                .map_err(|_| RenderError::ObjectCreation("program"))?;
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);
            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(RenderError::ProgramLink(log));
            }
            Ok(Self { program })
        }
    }

    /// Makes the program current.
    pub fn bind(&self, gl: &glow::Context) {
        unsafe {
            gl.use_program(Some(self.program));
        }
    }

    /// Releases the program.
    pub fn delete(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_program(self.program);
        }
    }
}

unsafe fn compile(
    gl: &glow::Context,
    stage: u32,
    source: &str,
) -> Result<glow::Shader, RenderError> {
    let shader = gl
        .create_shader(stage)
        .map_err(|_| RenderError::ObjectCreation("shader"))?;
    gl.shader_source(shader, source);
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(RenderError::ShaderCompile(log));
    }
    Ok(shader)
}

/// Creates a buffer and uploads `data` to it.
pub fn create_buffer_with(
    gl: &glow::Context,
    target: u32,
    data: &[u8],
    usage: u32,
) -> Result<glow::Buffer, RenderError> {
    unsafe {
        let buffer = gl
            .create_buffer()
            .map_err(|_| RenderError::ObjectCreation("buffer"))?;
        gl.bind_buffer(target, Some(buffer));
        gl.buffer_data_u8_slice(target, data, usage);
        Ok(buffer)
    }
}

/// Re-uploads a buffer's contents.
pub fn upload_buffer(gl: &glow::Context, target: u32, buffer: glow::Buffer, data: &[u8], usage: u32) {
    unsafe {
        gl.bind_buffer(target, Some(buffer));
        gl.buffer_data_u8_slice(target, data, usage);
    }
}

/// Enables a float vertex attribute, optionally advancing per instance.
pub fn float_attrib(
    gl: &glow::Context,
    location: u32,
    components: i32,
    stride: i32,
    offset: i32,
    per_instance: bool,
) {
    unsafe {
        gl.enable_vertex_attrib_array(location);
        gl.vertex_attrib_pointer_f32(location, components, glow::FLOAT, false, stride, offset);
        gl.vertex_attrib_divisor(location, if per_instance { 1 } else { 0 });
    }
}
