use serde::{Deserialize, Serialize};

mod gpu;
#[cfg(feature = "gl")]
mod glow_backend;

pub use gpu::{
    BufferHandle, DrawOutcome, GpuBackend, GpuProgramCache, GpuProgramEntry, ProgramHandle, ProgramKey,
    ShaderSources, UniformHandle, UniformValue, FULLSCREEN_QUAD,
};
#[cfg(feature = "gl")]
pub use glow_backend::GlowBackend;
#[cfg(test)]
pub(crate) use gpu::testing;

/// Straight-alpha RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Self = Self::rgb(0, 0, 0);
    pub const WHITE: Self = Self::rgb(255, 255, 255);
    pub const TRANSPARENT: Self = Self::rgba(0, 0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parses `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(text: &str) -> Option<Self> {
        let hex = text.strip_prefix('#')?;
        let channel = |index: usize| {
            hex.get(index..index + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        };
        match hex.len() {
            6 => Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Some(Self::rgba(channel(0)?, channel(2)?, channel(4)?, channel(6)?)),
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

/// One immediate-mode drawing primitive, tagged with the opacity that was in
/// effect when it was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DrawCommand {
    Clear {
        color: Color,
    },
    FillRect {
        rect: Rect,
        color: Color,
        opacity: f32,
    },
    FillEllipse {
        center: Point,
        radius_x: f32,
        radius_y: f32,
        color: Color,
        opacity: f32,
    },
    StrokeLine {
        from: Point,
        to: Point,
        width: f32,
        color: Color,
        opacity: f32,
    },
}

/// Drawing target handed to every unit for one frame.
///
/// Raster primitives are issued immediately. Units that render on the GPU
/// reach the program cache through [`Surface::gpu`], which is only available
/// when the surface is backed by a live graphics context on the render thread.
pub trait Surface {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Opacity applied to subsequent primitives, in `[0, 1]`.
    fn set_opacity(&mut self, opacity: f32);
    fn opacity(&self) -> f32;

    fn clear(&mut self, color: Color);
    fn fill_rect(&mut self, rect: Rect, color: Color);
    fn fill_ellipse(&mut self, center: Point, radius_x: f32, radius_y: f32, color: Color);
    fn stroke_line(&mut self, from: Point, to: Point, width: f32, color: Color);

    fn gpu(&mut self) -> Option<&mut GpuProgramCache> {
        None
    }

    /// Replays a recorded command. Its recorded opacity is multiplied into
    /// the current one for the duration of the primitive.
    fn apply(&mut self, command: &DrawCommand) {
        let base = self.opacity();
        match *command {
            DrawCommand::Clear { color } => self.clear(color),
            DrawCommand::FillRect {
                rect,
                color,
                opacity,
            } => {
                self.set_opacity(base * opacity);
                self.fill_rect(rect, color);
            }
            DrawCommand::FillEllipse {
                center,
                radius_x,
                radius_y,
                color,
                opacity,
            } => {
                self.set_opacity(base * opacity);
                self.fill_ellipse(center, radius_x, radius_y, color);
            }
            DrawCommand::StrokeLine {
                from,
                to,
                width,
                color,
                opacity,
            } => {
                self.set_opacity(base * opacity);
                self.stroke_line(from, to, width, color);
            }
        }
        self.set_opacity(base);
    }
}

/// Surface that records primitives for later replay by the host. It can carry
/// a GPU program cache so shader units draw through the same frame.
pub struct DisplayList {
    width: u32,
    height: u32,
    opacity: f32,
    commands: Vec<DrawCommand>,
    gpu: Option<GpuProgramCache>,
}

impl DisplayList {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            opacity: 1.0,
            commands: Vec::new(),
            gpu: None,
        }
    }

    pub fn with_gpu(mut self, cache: GpuProgramCache) -> Self {
        self.gpu = Some(cache);
        self
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    /// Hands out the recorded commands and starts a fresh frame.
    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        self.opacity = 1.0;
        std::mem::take(&mut self.commands)
    }

    pub fn gpu_cache(&self) -> Option<&GpuProgramCache> {
        self.gpu.as_ref()
    }

    pub fn gpu_cache_mut(&mut self) -> Option<&mut GpuProgramCache> {
        self.gpu.as_mut()
    }

    pub fn into_gpu_cache(self) -> Option<GpuProgramCache> {
        self.gpu
    }
}

impl Surface for DisplayList {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_finite() {
            opacity.clamp(0.0, 1.0)
        } else {
            1.0
        };
    }

    fn opacity(&self) -> f32 {
        self.opacity
    }

    fn clear(&mut self, color: Color) {
        self.commands.push(DrawCommand::Clear { color });
    }

    fn fill_rect(&mut self, rect: Rect, color: Color) {
        self.commands.push(DrawCommand::FillRect {
            rect,
            color,
            opacity: self.opacity,
        });
    }

    fn fill_ellipse(&mut self, center: Point, radius_x: f32, radius_y: f32, color: Color) {
        self.commands.push(DrawCommand::FillEllipse {
            center,
            radius_x,
            radius_y,
            color,
            opacity: self.opacity,
        });
    }

    fn stroke_line(&mut self, from: Point, to: Point, width: f32, color: Color) {
        self.commands.push(DrawCommand::StrokeLine {
            from,
            to,
            width,
            color,
            opacity: self.opacity,
        });
    }

    fn gpu(&mut self) -> Option<&mut GpuProgramCache> {
        self.gpu.as_mut()
    }
}

impl std::fmt::Debug for DisplayList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayList")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("opacity", &self.opacity)
            .field("commands", &self.commands.len())
            .field("gpu", &self.gpu.is_some())
            .finish()
    }
}
