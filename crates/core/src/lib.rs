//! Core library for the visual runtime.
//!
//! Visual units are discovered from a plugin directory and hot-reloaded
//! when their files change. A transition engine crossfades between them, a
//! frame scheduler drives drawing and pauses while the output is hidden, and
//! an audio pipeline publishes bass, mid and treble energy for units to react
//! to. Each module owns one of these subsystems.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod plugin;
pub mod render;
pub mod runtime;
pub mod timeline;
pub mod transition;
pub mod unit;

pub use analysis::{AudioSnapshot, BandAnalyzer};
pub use audio::{AudioSignalSource, CaptureState, SampleSource, SnapshotSlot};
pub use config::{AppConfig, AudioConfig, ConfigMap, PluginConfig, Preset, RenderConfig};
pub use error::{Result, VisualError};
pub use plugin::{PluginLoader, UnitHandle};
pub use render::{
    Color, DisplayList, DrawCommand, GpuBackend, GpuProgramCache, Point, ProgramKey, Rect,
    ShaderSources, Surface, UniformValue,
};
pub use runtime::Visualiser;
pub use timeline::{FpsCounter, FrameScheduler, SchedulerState, VisibilityProbe};
pub use transition::TransitionEngine;
pub use unit::{FrameInput, SchemaField, VisualUnit};
