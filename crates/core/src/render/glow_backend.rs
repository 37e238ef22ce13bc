//! OpenGL implementation of [`GpuBackend`] on top of `glow`.

use std::collections::HashMap;
use std::sync::Arc;

use glow::HasContext;

use super::gpu::{BufferHandle, GpuBackend, ProgramHandle, UniformHandle, UniformValue};

/// Name of the vertex attribute the full-surface quad is bound to.
const POSITION_ATTRIBUTE: &str = "position";

struct QuadBuffer {
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    vertex_count: i32,
}

/// Backend driving a `glow` context that is current on the render thread.
pub struct GlowBackend {
    gl: Arc<glow::Context>,
    next_id: u32,
    programs: HashMap<u32, glow::Program>,
    buffers: HashMap<u32, QuadBuffer>,
    uniforms: HashMap<u32, glow::UniformLocation>,
}

impl GlowBackend {
    /// # Safety
    ///
    /// `gl` must be current on the calling thread for the lifetime of the
    /// backend, and every later call must happen on that thread.
    pub unsafe fn new(gl: Arc<glow::Context>) -> Self {
        let renderer = unsafe { gl.get_parameter_string(glow::RENDERER) };
        let vendor = unsafe { gl.get_parameter_string(glow::VENDOR) };
        tracing::info!(%renderer, %vendor, "OpenGL backend ready");

        Self {
            gl,
            next_id: 0,
            programs: HashMap::new(),
            buffers: HashMap::new(),
            uniforms: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuBackend for GlowBackend {
    fn compile_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramHandle, String> {
        let program = unsafe { compile_program(&self.gl, vertex, fragment) }?;
        let id = self.allocate_id();
        self.programs.insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn create_vertex_buffer(
        &mut self,
        program: ProgramHandle,
        vertices: &[f32],
    ) -> Result<BufferHandle, String> {
        let program = *self
            .programs
            .get(&program.0)
            .ok_or_else(|| "unknown program".to_string())?;
        let bytes: Vec<u8> = vertices.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let gl = &self.gl;

        let quad = unsafe {
            let vao = gl.create_vertex_array()?;
            let vbo = gl.create_buffer()?;
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STATIC_DRAW);

            let location = gl
                .get_attrib_location(program, POSITION_ATTRIBUTE)
                .unwrap_or(0);
            gl.vertex_attrib_pointer_f32(location, 2, glow::FLOAT, false, 0, 0);
            gl.enable_vertex_attrib_array(location);

            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            gl.bind_vertex_array(None);

            QuadBuffer {
                vao,
                vbo,
                vertex_count: i32::try_from(vertices.len() / 2).unwrap_or(i32::MAX),
            }
        };

        let id = self.allocate_id();
        self.buffers.insert(id, quad);
        Ok(BufferHandle(id))
    }

    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformHandle> {
        let program = *self.programs.get(&program.0)?;
        let location = unsafe { self.gl.get_uniform_location(program, name) }?;
        let id = self.allocate_id();
        self.uniforms.insert(id, location);
        Some(UniformHandle(id))
    }

    fn draw_strip(
        &mut self,
        program: ProgramHandle,
        buffer: BufferHandle,
        uniforms: &[(UniformHandle, UniformValue)],
        opacity: f32,
    ) {
        let (Some(program), Some(quad)) = (self.programs.get(&program.0), self.buffers.get(&buffer.0))
        else {
            return;
        };
        let gl = &self.gl;

        unsafe {
            gl.use_program(Some(*program));
            for (handle, value) in uniforms {
                let Some(location) = self.uniforms.get(&handle.0) else {
                    continue;
                };
                match *value {
                    UniformValue::Float(v) => gl.uniform_1_f32(Some(location), v),
                    UniformValue::Vec2([x, y]) => gl.uniform_2_f32(Some(location), x, y),
                    UniformValue::Vec3([x, y, z]) => gl.uniform_3_f32(Some(location), x, y, z),
                    UniformValue::Int(v) => gl.uniform_1_i32(Some(location), v),
                }
            }

            // Crossfade opacity is applied with constant-alpha blending so
            // shaders do not need to know about it.
            gl.enable(glow::BLEND);
            gl.blend_color(0.0, 0.0, 0.0, opacity);
            gl.blend_func(glow::CONSTANT_ALPHA, glow::ONE_MINUS_CONSTANT_ALPHA);

            gl.bind_vertex_array(Some(quad.vao));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, quad.vertex_count);
            gl.bind_vertex_array(None);
            gl.use_program(None);

            gl.blend_func(glow::ONE, glow::ONE_MINUS_SRC_ALPHA);
        }
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if let Some(program) = self.programs.remove(&program.0) {
            unsafe { self.gl.delete_program(program) };
        }
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if let Some(quad) = self.buffers.remove(&buffer.0) {
            unsafe {
                self.gl.delete_vertex_array(quad.vao);
                self.gl.delete_buffer(quad.vbo);
            }
        }
    }
}

/// Compile and link a vertex + fragment program.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
unsafe fn compile_program(
    gl: &glow::Context,
    vertex_src: &str,
    fragment_src: &str,
) -> Result<glow::Program, String> {
    let vs = unsafe { compile_shader(gl, glow::VERTEX_SHADER, vertex_src) }?;
    let fs = match unsafe { compile_shader(gl, glow::FRAGMENT_SHADER, fragment_src) } {
        Ok(fs) => fs,
        Err(err) => {
            unsafe { gl.delete_shader(vs) };
            return Err(err);
        }
    };

    unsafe {
        let program = match gl.create_program() {
            Ok(program) => program,
            Err(err) => {
                gl.delete_shader(vs);
                gl.delete_shader(fs);
                return Err(err);
            }
        };
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        gl.link_program(program);

        gl.detach_shader(program, vs);
        gl.detach_shader(program, fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);

        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(format!("program link error: {log}"));
        }

        Ok(program)
    }
}

/// # Safety
///
/// Requires a valid, current OpenGL context.
unsafe fn compile_shader(
    gl: &glow::Context,
    shader_type: u32,
    source: &str,
) -> Result<glow::Shader, String> {
    unsafe {
        let shader = gl.create_shader(shader_type)?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(format!("shader compile error: {log}"));
        }

        Ok(shader)
    }
}

impl std::fmt::Debug for GlowBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlowBackend")
            .field("programs", &self.programs.len())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}
