use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, VisualError};

mod preset;

pub use preset::{PlaylistEntry, Preset, PresetLocation};

/// Configuration dictionary handed to [`crate::VisualUnit::configure`].
pub type ConfigMap = serde_json::Map<String, Value>;

/// Top-level configuration structure for the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub render: RenderConfig,
    pub plugins: PluginConfig,
}

impl AppConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| VisualError::Config(err.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Weight of the previous snapshot when a new one is published, `0.0`
    /// publishes raw band values.
    pub smoothing: f32,
    /// Input device name; the default input device is used when absent.
    pub device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_size: 1024,
            smoothing: 0.0,
            device: None,
        }
    }
}

/// Frame pacing and crossfade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub target_fps: u32,
    pub visibility_poll_ms: u64,
    /// Alpha added per tick while a crossfade is running.
    pub transition_step: f32,
    /// Phase added per tick, wrapped into `[0, 1)`.
    pub phase_step: f32,
    /// Frames after which a failed shader program is compiled again. `None`
    /// keeps it blank for the rest of the session.
    pub shader_retry_after_frames: Option<u64>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            target_fps: 22,
            visibility_poll_ms: 800,
            transition_step: 0.015,
            phase_step: 0.0035,
            shader_retry_after_frames: None,
        }
    }
}

impl RenderConfig {
    pub fn visibility_interval(&self) -> Duration {
        Duration::from_millis(self.visibility_poll_ms.max(1))
    }
}

/// Plugin discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub directory: PathBuf,
    /// Minimum time between two reload checks of the same source.
    pub reload_cooldown_ms: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            reload_cooldown_ms: 2_000,
        }
    }
}

impl PluginConfig {
    pub fn reload_cooldown(&self) -> Duration {
        Duration::from_millis(self.reload_cooldown_ms)
    }
}

/// Converts a frame rate into the periodic callback interval.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

// The readers below merge one recognized key into `target`. A missing key or a
// value of the wrong type leaves `target` untouched and returns `false`.

pub fn read_f32(config: &ConfigMap, key: &str, target: &mut f32, min: f32, max: f32) -> bool {
    match config.get(key).and_then(Value::as_f64) {
        Some(value) if value.is_finite() => {
            *target = (value as f32).clamp(min, max);
            true
        }
        _ => false,
    }
}

pub fn read_i64(config: &ConfigMap, key: &str, target: &mut i64, min: i64, max: i64) -> bool {
    match config.get(key).and_then(Value::as_i64) {
        Some(value) => {
            *target = value.clamp(min, max);
            true
        }
        None => false,
    }
}

pub fn read_bool(config: &ConfigMap, key: &str, target: &mut bool) -> bool {
    match config.get(key).and_then(Value::as_bool) {
        Some(value) => {
            *target = value;
            true
        }
        None => false,
    }
}

pub fn read_string(config: &ConfigMap, key: &str, target: &mut String) -> bool {
    match config.get(key).and_then(Value::as_str) {
        Some(value) => {
            *target = value.to_string();
            true
        }
        None => false,
    }
}

/// Accepts `"#rrggbb"`, `"#rrggbbaa"` or an `[r, g, b(, a)]` array of 0-255 values.
pub fn read_color(config: &ConfigMap, key: &str, target: &mut crate::Color) -> bool {
    let parsed = match config.get(key) {
        Some(Value::String(text)) => crate::Color::from_hex(text),
        Some(Value::Array(items)) => {
            let channels: Option<Vec<u8>> = items
                .iter()
                .map(|item| item.as_u64().and_then(|v| u8::try_from(v).ok()))
                .collect();
            match channels.as_deref() {
                Some([r, g, b]) => Some(crate::Color::rgb(*r, *g, *b)),
                Some([r, g, b, a]) => Some(crate::Color::rgba(*r, *g, *b, *a)),
                _ => None,
            }
        }
        _ => None,
    };

    match parsed {
        Some(color) => {
            *target = color;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Color;

    fn map(value: Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_match_host_constants() {
        let config = AppConfig::default();
        assert_eq!(config.render.target_fps, 22);
        assert_eq!(config.plugins.reload_cooldown(), Duration::from_secs(2));
        assert_eq!(config.audio.block_size, 1024);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json_str(r#"{ "render": { "target_fps": 60 } }"#).unwrap();
        assert_eq!(config.render.target_fps, 60);
        assert_eq!(config.render.visibility_poll_ms, 800);
        assert_eq!(config.audio.sample_rate, 44_100);
    }

    #[test]
    fn readers_keep_prior_value_on_bad_input() {
        let config = map(json!({ "speed": "fast", "count": 3.5, "on": 1 }));
        let mut speed = 2.0;
        let mut count = 7;
        let mut on = true;

        assert!(!read_f32(&config, "speed", &mut speed, 0.0, 10.0));
        assert!(!read_i64(&config, "count", &mut count, 0, 10));
        assert!(!read_bool(&config, "on", &mut on));
        assert_eq!(speed, 2.0);
        assert_eq!(count, 7);
        assert!(on);
    }

    #[test]
    fn readers_clamp_into_range() {
        let config = map(json!({ "speed": 50.0 }));
        let mut speed = 1.0;
        assert!(read_f32(&config, "speed", &mut speed, 0.0, 20.0));
        assert_eq!(speed, 20.0);
    }

    #[test]
    fn colors_parse_from_hex_and_arrays() {
        let config = map(json!({ "a": "#ff8000", "b": [1, 2, 3, 4], "c": [1, 2] }));
        let mut color = Color::BLACK;
        assert!(read_color(&config, "a", &mut color));
        assert_eq!(color, Color::rgb(255, 128, 0));
        assert!(read_color(&config, "b", &mut color));
        assert_eq!(color, Color::rgba(1, 2, 3, 4));
        assert!(!read_color(&config, "c", &mut color));
        assert_eq!(color, Color::rgba(1, 2, 3, 4));
    }
}
