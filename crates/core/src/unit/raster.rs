use super::{FrameInput, SchemaField, VisualUnit};
use crate::{ConfigMap, Result, Surface};

/// Content of a unit drawn with immediate 2D primitives.
pub trait RasterEffect: Send {
    fn configure(&mut self, _config: &ConfigMap) {}

    fn schema(&self) -> Vec<SchemaField> {
        Vec::new()
    }

    /// Paints one frame. `background` tells the effect whether to fill its
    /// own backdrop or leave the host background visible through it.
    fn paint(&mut self, surface: &mut dyn Surface, frame: &FrameInput, background: bool)
        -> Result<()>;
}

/// [`VisualUnit`] issuing raster primitives on every draw.
pub struct RasterUnit<E> {
    identity: String,
    effect: E,
    background_visible: bool,
}

impl<E: RasterEffect> RasterUnit<E> {
    pub fn new(identity: impl Into<String>, effect: E) -> Self {
        Self {
            identity: identity.into(),
            effect,
            background_visible: true,
        }
    }

    pub fn effect(&self) -> &E {
        &self.effect
    }
}

impl<E: RasterEffect> VisualUnit for RasterUnit<E> {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn configure(&mut self, config: &ConfigMap) {
        self.effect.configure(config);
    }

    fn draw(&mut self, surface: &mut dyn Surface, frame: &FrameInput) -> Result<()> {
        self.effect.paint(surface, frame, self.background_visible)
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
}
