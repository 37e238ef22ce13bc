use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::{Result, VisualError};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub identity: String,
    /// File name relative to the plugin directory.
    pub entry: String,
}

/// Explicit identities for entry files of one plugin directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    by_entry: HashMap<String, String>,
}

impl Manifest {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(text).map_err(|err| VisualError::Config(err.to_string()))?;

        let mut by_entry = HashMap::new();
        for entry in entries {
            let identity = entry.identity.trim();
            if identity.is_empty() {
                return Err(VisualError::Config(format!("`{}` has an empty identity", entry.entry)));
            }
            if by_entry.insert(entry.entry.clone(), identity.to_string()).is_some() {
                return Err(VisualError::Config(format!("`{}` is listed twice", entry.entry)));
            }
        }
        Ok(Self { by_entry })
    }

    /// Reads `manifest.json` from `directory`. A missing file is an empty
    /// manifest.
    pub fn load(directory: &Path) -> Result<Self> {
        let path = directory.join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_json_str(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn identity_for(&self, file_name: &str) -> Option<&str> {
        self.by_entry.get(file_name).map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_entry
            .iter()
            .map(|(entry, identity)| (entry.as_str(), identity.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_entry.is_empty()
    }
}
