use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConfigMap;
use crate::{Result, VisualError};

const BUNDLE_PRESET_FILE: &str = "preset.json";
const BUNDLE_EFFECTS_DIR: &str = "effects";

/// Preset description delivered by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    /// Identity of the unit to switch to.
    pub effect: Option<String>,
    pub effect_config: ConfigMap,
    pub fps: Option<u32>,
    pub show_background: Option<bool>,
    /// Opaque background description, consumed by the host.
    pub background: Option<Value>,
    pub effects_playlist: Vec<PlaylistEntry>,
    /// Milliseconds between playlist rotations.
    pub playlist_interval: Option<u64>,
}

/// One playlist slot: a bare identity or an identity with configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaylistEntry {
    Identity(String),
    Configured {
        effect: String,
        #[serde(default)]
        config: ConfigMap,
    },
}

impl PlaylistEntry {
    pub fn identity(&self) -> &str {
        match self {
            Self::Identity(identity) => identity,
            Self::Configured { effect, .. } => effect,
        }
    }

    pub fn config(&self) -> Option<&ConfigMap> {
        match self {
            Self::Identity(_) => None,
            Self::Configured { config, .. } => Some(config),
        }
    }
}

impl Preset {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| VisualError::Config(err.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

/// Where a preset lives on disk: a single JSON file or a bundle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetLocation {
    pub preset_file: PathBuf,
    /// Plugin directory shipped with a bundle.
    pub effects_dir: Option<PathBuf>,
}

impl PresetLocation {
    /// Resolves `path` into a preset file. Directories are bundles carrying a
    /// `preset.json` and optionally an `effects/` directory; plain names get a
    /// `.json` extension appended when missing.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.is_dir() {
            let preset_file = path.join(BUNDLE_PRESET_FILE);
            if !preset_file.is_file() {
                return Err(VisualError::Config(format!(
                    "bundle `{}` has no {BUNDLE_PRESET_FILE}",
                    path.display()
                )));
            }
            let effects = path.join(BUNDLE_EFFECTS_DIR);
            return Ok(Self {
                preset_file,
                effects_dir: effects.is_dir().then_some(effects),
            });
        }

        let preset_file = if path.extension().is_some_and(|ext| ext == "json") {
            path.to_path_buf()
        } else {
            let mut name = path.as_os_str().to_owned();
            name.push(".json");
            PathBuf::from(name)
        };

        if !preset_file.is_file() {
            return Err(VisualError::Config(format!(
                "preset not found: {}",
                preset_file.display()
            )));
        }

        Ok(Self {
            preset_file,
            effects_dir: None,
        })
    }
}
