//! The capability contract shared by every visual unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AudioSnapshot, ConfigMap, GpuProgramCache, Result, Surface};

mod builtin;
mod raster;
mod shader;

pub use builtin::{GradientShader, NoopUnit, PulseEffect, NOOP_IDENTITY};
pub use raster::{RasterEffect, RasterUnit};
pub use shader::{ShaderEffect, ShaderUnit, DEFAULT_FRAGMENT_SHADER, DEFAULT_VERTEX_SHADER};

/// Per-frame inputs. Both units of a crossfade receive the same value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    pub width: u32,
    pub height: u32,
    /// Animation phase in `[0, 1)`.
    pub phase: f32,
    pub audio: AudioSnapshot,
}

/// A renderable behavior hosted by the runtime.
///
/// `draw` must leave the surface usable when it fails: errors are logged by
/// the caller and the unit is skipped for that frame only.
pub trait VisualUnit: Send {
    fn identity(&self) -> &str;

    /// Merges recognized keys into the unit's state. Unknown keys and values
    /// of the wrong type are ignored.
    fn configure(&mut self, config: &ConfigMap);

    fn draw(&mut self, surface: &mut dyn Surface, frame: &FrameInput) -> Result<()>;

    /// Parameters an external editor may change. Empty means none.
    fn config_schema(&self) -> Vec<SchemaField> {
        Vec::new()
    }

    fn background_visible(&self) -> bool;
    fn set_background_visible(&mut self, visible: bool);

    /// Frees GPU resources owned on the unit's behalf. Called on the render
    /// thread before the unit is dropped.
    fn release_gpu(&mut self, _cache: &mut GpuProgramCache) {}

    /// Sticky error a unit recorded about itself, such as a failed shader
    /// compilation.
    fn last_error(&self) -> Option<&str> {
        None
    }
}

impl std::fmt::Debug for dyn VisualUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisualUnit")
            .field("identity", &self.identity())
            .field("background_visible", &self.background_visible())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Float,
    Int,
    Bool,
    Color,
    String,
}

/// One externally editable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub default: Value,
    pub label: String,
}

impl SchemaField {
    pub fn float(key: &str, label: &str, min: f64, max: f64, default: f64) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Float,
            min: Some(min),
            max: Some(max),
            default: Value::from(default),
            label: label.to_string(),
        }
    }

    pub fn int(key: &str, label: &str, min: i64, max: i64, default: i64) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Int,
            min: Some(min as f64),
            max: Some(max as f64),
            default: Value::from(default),
            label: label.to_string(),
        }
    }

    pub fn bool(key: &str, label: &str, default: bool) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Bool,
            min: None,
            max: None,
            default: Value::from(default),
            label: label.to_string(),
        }
    }

    pub fn color(key: &str, label: &str, default: crate::Color) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::Color,
            min: None,
            max: None,
            default: Value::from(default.to_hex()),
            label: label.to_string(),
        }
    }

    pub fn string(key: &str, label: &str, default: &str) -> Self {
        Self {
            key: key.to_string(),
            kind: FieldKind::String,
            min: None,
            max: None,
            default: Value::from(default),
            label: label.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_serializes_for_editors() {
        let field = SchemaField::float("speed", "Speed", 1.0, 20.0, 3.0);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "float");
        assert_eq!(json["min"], 1.0);
        assert_eq!(json["default"], 3.0);

        let json = serde_json::to_value(SchemaField::bool("trail", "Trail", true)).unwrap();
        assert!(json.get("min").is_none());
    }
}
