use std::borrow::Cow;
use std::time::Instant;

use super::{FrameInput, SchemaField, VisualUnit};
use crate::{
    ConfigMap, GpuProgramCache, ProgramKey, Result, ShaderSources, Surface, UniformValue,
    VisualError,
};

pub const DEFAULT_VERTEX_SHADER: &str = r#"#version 330
layout(location = 0) in vec2 position;
out vec2 uv;
void main() {
    uv = position * 0.5 + 0.5;
    gl_Position = vec4(position, 0.0, 1.0);
}
"#;

pub const DEFAULT_FRAGMENT_SHADER: &str = r#"#version 330
out vec4 fragColor;
uniform float iTime;
uniform vec2 iResolution;
void main() {
    vec2 uv = gl_FragCoord.xy / iResolution.xy;
    fragColor = vec4(uv.x, uv.y, 0.5 + 0.5 * sin(iTime), 1.0);
}
"#;

/// Content of a unit rendered by a fragment program over the whole surface.
///
/// Every draw binds `iTime` (seconds since the unit was created),
/// `iResolution` and `iAudio` (bass, mid, treble) when the program declares
/// them, followed by whatever [`ShaderEffect::uniforms`] adds.
pub trait ShaderEffect: Send {
    fn fragment_source(&self) -> Cow<'_, str>;

    fn vertex_source(&self) -> Cow<'_, str> {
        Cow::Borrowed(DEFAULT_VERTEX_SHADER)
    }

    fn configure(&mut self, _config: &ConfigMap) {}

    fn schema(&self) -> Vec<SchemaField> {
        Vec::new()
    }

    fn uniforms(&self, _frame: &FrameInput, _out: &mut Vec<(String, UniformValue)>) {}
}

/// [`VisualUnit`] drawing through the render thread's [`GpuProgramCache`].
///
/// Compilation happens on the first draw that has GPU access. A failed
/// compilation is logged once; after that the unit draws nothing. On a
/// surface without GPU access the unit is transparent.
pub struct ShaderUnit<E> {
    identity: String,
    effect: E,
    key: ProgramKey,
    sources: Option<ShaderSources>,
    started: Instant,
    background_visible: bool,
    compile_error: Option<String>,
    warned_no_gpu: bool,
}

impl<E: ShaderEffect> ShaderUnit<E> {
    pub fn new(identity: impl Into<String>, effect: E) -> Self {
        Self {
            identity: identity.into(),
            effect,
            key: ProgramKey::next(),
            sources: None,
            started: Instant::now(),
            background_visible: true,
            compile_error: None,
            warned_no_gpu: false,
        }
    }

    pub fn program_key(&self) -> ProgramKey {
        self.key
    }

    pub fn effect(&self) -> &E {
        &self.effect
    }
}

impl<E: ShaderEffect> VisualUnit for ShaderUnit<E> {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn configure(&mut self, config: &ConfigMap) {
        self.effect.configure(config);
    }

    fn draw(&mut self, surface: &mut dyn Surface, frame: &FrameInput) -> Result<()> {
        let opacity = surface.opacity();
        let Some(cache) = surface.gpu() else {
            if !self.warned_no_gpu {
                tracing::debug!(unit = %self.identity, "surface has no GPU access; shader unit stays blank");
                self.warned_no_gpu = true;
            }
            return Ok(());
        };

        let effect = &self.effect;
        let identity = &self.identity;
        let sources = self.sources.get_or_insert_with(|| ShaderSources {
            label: identity.clone(),
            vertex: effect.vertex_source().into_owned(),
            fragment: effect.fragment_source().into_owned(),
        });

        let mut extra = Vec::new();
        self.effect.uniforms(frame, &mut extra);

        let mut uniforms = vec![
            ("iTime", UniformValue::Float(self.started.elapsed().as_secs_f32())),
            (
                "iResolution",
                UniformValue::Vec2([frame.width as f32, frame.height as f32]),
            ),
            ("iAudio", UniformValue::Vec3(frame.audio.as_array())),
        ];
        uniforms.extend(extra.iter().map(|(name, value)| (name.as_str(), *value)));

        match cache.draw(self.key, sources, &uniforms, opacity) {
            Ok(_) => Ok(()),
            Err(VisualError::ShaderCompile { unit, log }) => {
                tracing::warn!(%unit, %log, "shader compilation failed, unit will draw nothing");
                self.compile_error = Some(log);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn config_schema(&self) -> Vec<SchemaField> {
        self.effect.schema()
    }

    fn background_visible(&self) -> bool {
        self.background_visible
    }

    fn set_background_visible(&mut self, visible: bool) {
        self.background_visible = visible;
    }

    fn release_gpu(&mut self, cache: &mut GpuProgramCache) {
        cache.release(self.key);
    }

    fn last_error(&self) -> Option<&str> {
        self.compile_error.as_deref()
    }
}
