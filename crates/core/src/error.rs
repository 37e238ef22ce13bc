use std::path::PathBuf;

/// Result alias that carries the custom [`VisualError`] type.
pub type Result<T> = std::result::Result<T, VisualError>;

/// Common error type for the core crate.
///
/// Only `PluginLoad`, `PluginReload` and `ShaderCompile` are reported to the
/// log sink by the runtime; every variant is recovered locally and none of
/// them stops the frame loop.
#[derive(Debug, thiserror::Error)]
pub enum VisualError {
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A caller handed in data the operation cannot work with.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Configuration or preset content could not be interpreted.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Library(#[from] libloading::Error),
    #[error("fft failure: {0}")]
    Fft(String),
    /// A plugin file exists but its unit could not be constructed.
    #[error("failed to load plugin `{}`: {reason}", path.display())]
    PluginLoad { path: PathBuf, reason: String },
    /// A previously working unit failed to rebuild; the old instance stays live.
    #[error("failed to reload `{identity}`: {reason}")]
    PluginReload { identity: String, reason: String },
    /// The GPU program of a shader unit did not compile or link.
    #[error("shader compilation failed for `{unit}`: {log}")]
    ShaderCompile { unit: String, log: String },
    /// No input device could be opened; audio falls back to silence.
    #[error("audio device unavailable: {0}")]
    AudioDeviceUnavailable(String),
    /// A single draw call of a unit failed.
    #[error("draw failed for `{unit}`: {reason}")]
    Draw { unit: String, reason: String },
}

impl VisualError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PluginLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn draw(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Draw {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

impl From<&str> for VisualError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VisualError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for VisualError {
    fn from(value: realfft::FftError) -> Self {
        Self::Fft(value.to_string())
    }
}
