//! Units compiled into the runtime.

use std::borrow::Cow;

use super::{FrameInput, RasterEffect, RasterUnit, SchemaField, ShaderEffect, ShaderUnit, VisualUnit};
use crate::config::{read_bool, read_color, read_f32};
use crate::{Color, ConfigMap, Point, Rect, Result, Surface, UniformValue};

/// Identity of the fallback unit returned for unknown names.
pub const NOOP_IDENTITY: &str = "none";

/// Draws nothing.
#[derive(Debug)]
pub struct NoopUnit {
    background_visible: bool,
}

impl NoopUnit {
    pub fn new() -> Self {
        Self {
            background_visible: true,
        }
    }
}

impl Default for NoopUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualUnit for NoopUnit {
    fn identity(&self) -> &str {
        NOOP_IDENTITY
    }

    fn configure(&mut self, _config: &ConfigMap) {}

    fn draw(&mut self, _surface: &mut dyn Surface, _frame: &FrameInput) -> Result<()> {
        Ok(())
    }

    fn background_visible(&self) -> bool {
        self.background_visible
    }

    fn set_background_visible(&mut self, visible: bool) {
        self.background_visible = visible;
    }
}

/// A disc in the middle of the surface that swells with the bass band.
#[derive(Debug, Clone)]
pub struct PulseEffect {
    color: Color,
    backdrop: Color,
    size: f32,
    ring: bool,
}

impl PulseEffect {
    pub const IDENTITY: &'static str = "pulse";

    pub fn new() -> Self {
        Self {
            color: Color::rgb(0x40, 0xc0, 0xff),
            backdrop: Color::BLACK,
            size: 0.35,
            ring: true,
        }
    }

    pub fn unit() -> Box<dyn VisualUnit> {
        Box::new(RasterUnit::new(Self::IDENTITY, Self::new()))
    }
}

impl Default for PulseEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterEffect for PulseEffect {
    fn configure(&mut self, config: &ConfigMap) {
        read_color(config, "color", &mut self.color);
        read_color(config, "backdrop", &mut self.backdrop);
        read_f32(config, "size", &mut self.size, 0.05, 1.0);
        read_bool(config, "ring", &mut self.ring);
    }

    fn schema(&self) -> Vec<SchemaField> {
        vec![
            SchemaField::color("color", "Color", Color::rgb(0x40, 0xc0, 0xff)),
            SchemaField::color("backdrop", "Backdrop", Color::BLACK),
            SchemaField::float("size", "Size", 0.05, 1.0, 0.35),
            SchemaField::bool("ring", "Phase ring", true),
        ]
    }

    fn paint(&mut self, surface: &mut dyn Surface, frame: &FrameInput, background: bool) -> Result<()> {
        let (w, h) = (frame.width as f32, frame.height as f32);
        if background {
            surface.fill_rect(Rect::from_size(frame.width, frame.height), self.backdrop);
        }

        let center = Point::new(w / 2.0, h / 2.0);
        let base = w.min(h) * 0.5 * self.size;
        let radius = base * (1.0 + frame.audio.bass);
        surface.fill_ellipse(center, radius, radius, self.color);

        if self.ring {
            let angle = frame.phase * std::f32::consts::TAU;
            let reach = radius * (1.2 + frame.audio.treble);
            let tip = Point::new(center.x + reach * angle.cos(), center.y + reach * angle.sin());
            surface.stroke_line(center, tip, 1.0 + 4.0 * frame.audio.mid, self.color);
        }
        Ok(())
    }
}

/// Screen-space gradient tinted by the audio bands.
#[derive(Debug, Clone)]
pub struct GradientShader {
    intensity: f32,
}

impl GradientShader {
    pub const IDENTITY: &'static str = "gradient";

    const FRAGMENT: &'static str = r#"#version 330
out vec4 fragColor;
uniform float iTime;
uniform vec2 iResolution;
uniform vec3 iAudio;
uniform float u_intensity;
void main() {
    vec2 uv = gl_FragCoord.xy / iResolution.xy;
    vec3 base = vec3(uv.x, uv.y, 0.5 + 0.5 * sin(iTime));
    fragColor = vec4(base + iAudio * u_intensity, 1.0);
}
"#;

    pub fn new() -> Self {
        Self { intensity: 0.5 }
    }

    pub fn unit() -> Box<dyn VisualUnit> {
        Box::new(ShaderUnit::new(Self::IDENTITY, Self::new()))
    }
}

impl Default for GradientShader {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderEffect for GradientShader {
    fn fragment_source(&self) -> Cow<'_, str> {
        Cow::Borrowed(Self::FRAGMENT)
    }

    fn configure(&mut self, config: &ConfigMap) {
        read_f32(config, "intensity", &mut self.intensity, 0.0, 2.0);
    }

    fn schema(&self) -> Vec<SchemaField> {
        vec![SchemaField::float("intensity", "Audio tint", 0.0, 2.0, 0.5)]
    }

    fn uniforms(&self, _frame: &FrameInput, out: &mut Vec<(String, UniformValue)>) {
        out.push(("u_intensity".to_string(), UniformValue::Float(self.intensity)));
    }
}
