//! Discovery and hot reload of visual units.
//!
//! Units come from three places: factories compiled into the binary, fragment
//! shader files, and shared libraries exposing the C ABI in [`native`]. All
//! of them sit behind a [`PluginSource`], which keeps the last instance that
//! constructed successfully and swaps in a new one when its file changes.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::unit::{GradientShader, NoopUnit, PulseEffect, VisualUnit, NOOP_IDENTITY};
use crate::{GpuProgramCache, PluginConfig, Result, VisualError};

mod manifest;
pub mod native;
mod shader_file;
mod source;

pub use manifest::{Manifest, ManifestEntry, MANIFEST_FILE};
pub use shader_file::{ParamKind, ShaderFile, ShaderFileEffect, ShaderParam};
pub use source::{derive_identity, PluginSource, SourceKind, UnitFactory, UnitHandle};

/// A file that was found but could not be loaded the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Registry of every unit the runtime can switch to.
pub struct PluginLoader {
    units: BTreeMap<String, UnitHandle>,
    fallback: UnitHandle,
    failures: Vec<LoadFailure>,
    cooldown: Duration,
}

impl PluginLoader {
    pub fn new(config: &PluginConfig) -> Self {
        Self::with_cooldown(config.reload_cooldown())
    }

    /// Registry holding the builtin units, with `cooldown` between two
    /// reload checks of the same source.
    pub fn with_cooldown(cooldown: Duration) -> Self {
        let noop: UnitFactory = Arc::new(|| Box::new(NoopUnit::new()) as Box<dyn VisualUnit>);
        let fallback = UnitHandle::new(PluginSource::builtin(NOOP_IDENTITY, noop, cooldown));

        let mut units = BTreeMap::new();
        units.insert(NOOP_IDENTITY.to_string(), fallback.clone());

        let mut loader = Self {
            units,
            fallback,
            failures: Vec::new(),
            cooldown,
        };
        loader.register_builtin(PulseEffect::IDENTITY, PulseEffect::unit);
        loader.register_builtin(GradientShader::IDENTITY, GradientShader::unit);
        loader
    }

    /// Registers a compiled-in unit. The fallback identity is reserved.
    pub fn register_builtin<F>(&mut self, identity: &str, factory: F) -> bool
    where
        F: Fn() -> Box<dyn VisualUnit> + Send + Sync + 'static,
    {
        if identity == NOOP_IDENTITY {
            tracing::warn!(identity, "identity is reserved for the fallback unit");
            return false;
        }
        let source = PluginSource::builtin(identity, Arc::new(factory), self.cooldown);
        self.units.insert(identity.to_string(), UnitHandle::new(source));
        true
    }

    /// Loads every candidate file in `directory`. Files that fail to load are
    /// logged, recorded in [`failures`](Self::failures) and left out of the
    /// registry. A unit with an identity that is already registered replaces
    /// it. Returns the number of units loaded; a missing directory loads none.
    pub fn discover(&mut self, directory: &Path) -> Result<usize> {
        if !directory.is_dir() {
            tracing::info!(directory = %directory.display(), "plugin directory does not exist");
            return Ok(0);
        }

        let manifest = match Manifest::load(directory) {
            Ok(manifest) => manifest,
            Err(err) => {
                let path = directory.join(MANIFEST_FILE);
                tracing::warn!(path = %path.display(), %err, "ignoring unreadable manifest");
                self.record_failure(path, err.to_string());
                Manifest::default()
            }
        };

        let mut candidates: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect();
        candidates.sort();
        tracing::info!(
            directory = %directory.display(),
            candidates = candidates.len(),
            "scanning plugins"
        );

        let now = Instant::now();
        let mut loaded = 0;
        for path in candidates {
            let Some(kind) = SourceKind::for_path(&path) else {
                continue;
            };
            self.failures.retain(|failure| failure.path != path);

            let file_name = path.file_name().and_then(OsStr::to_str).unwrap_or_default();
            let declared = manifest.identity_for(file_name);
            let source = match PluginSource::load(&path, kind, declared, self.cooldown, now) {
                Ok(source) => source,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping plugin");
                    self.record_failure(path, err.to_string());
                    continue;
                }
            };

            let identity = source.identity().to_string();
            if identity == NOOP_IDENTITY {
                tracing::warn!(path = %path.display(), "identity is reserved for the fallback unit");
                self.record_failure(path, format!("identity `{NOOP_IDENTITY}` is reserved"));
                continue;
            }

            tracing::info!(
                %identity,
                path = %path.display(),
                kind = source.kind().label(),
                "unit registered"
            );
            if self.units.insert(identity.clone(), UnitHandle::new(source)).is_some() {
                tracing::debug!(%identity, "replaced a previously registered unit");
            }
            loaded += 1;
        }

        for (entry, identity) in manifest.entries() {
            if !directory.join(entry).is_file() {
                tracing::warn!(%identity, entry, "manifest entry has no matching file");
            }
        }

        Ok(loaded)
    }

    /// Loads the `effects` directory of a preset bundle. Its units take
    /// precedence over regular plugins with the same identity.
    pub fn discover_bundle(&mut self, bundle: &Path) -> Result<usize> {
        let effects = bundle.join("effects");
        if !effects.is_dir() {
            return Ok(0);
        }
        self.discover(&effects)
    }

    fn record_failure(&mut self, path: PathBuf, reason: String) {
        self.failures.retain(|failure| failure.path != path);
        self.failures.push(LoadFailure { path, reason });
    }

    /// The live unit registered as `identity`, after giving it a chance to
    /// reload. Unknown identities resolve to the no-op fallback.
    pub fn get(&self, identity: &str, now: Instant) -> UnitHandle {
        match self.units.get(identity) {
            Some(handle) => {
                handle.refresh(now);
                handle.clone()
            }
            None => {
                tracing::debug!(identity, "unknown unit, using the fallback");
                self.fallback.clone()
            }
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<&UnitHandle> {
        self.units.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.units.contains_key(identity)
    }

    pub fn fallback(&self) -> &UnitHandle {
        &self.fallback
    }

    pub fn identities(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Reloads `identity` from its source now, subject to the cooldown.
    pub fn reload(&self, identity: &str, now: Instant) -> Result<bool> {
        let handle = self
            .units
            .get(identity)
            .ok_or_else(|| VisualError::msg(format!("unknown unit `{identity}`")))?;
        handle.reload(now)
    }

    /// Gives every registered source a chance to reload.
    pub fn refresh_all(&self, now: Instant) -> usize {
        self.units
            .values()
            .filter(|handle| handle.refresh(now))
            .count()
    }

    /// Removes `identity` from the registry. Holders of the handle keep
    /// drawing it. The fallback cannot be unloaded.
    pub fn unload(&mut self, identity: &str) -> Option<UnitHandle> {
        if identity == NOOP_IDENTITY {
            return None;
        }
        let removed = self.units.remove(identity);
        if removed.is_some() {
            tracing::info!(identity, "unit unloaded");
        }
        removed
    }

    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    /// `(identity or path, message)` for every first-load failure and every
    /// unit currently reporting an error.
    pub fn errors(&self) -> Vec<(String, String)> {
        let mut errors: Vec<(String, String)> = self
            .failures
            .iter()
            .map(|failure| (failure.path.display().to_string(), failure.reason.clone()))
            .collect();
        for (identity, handle) in &self.units {
            if let Some(error) = handle.last_error() {
                errors.push((identity.clone(), error));
            }
        }
        errors
    }

    /// Drops instances replaced by reloads.
    pub fn collect_retired(&self, mut cache: Option<&mut GpuProgramCache>) -> usize {
        self.units
            .values()
            .map(|handle| handle.collect_retired(cache.as_deref_mut()))
            .sum()
    }

    /// Frees the GPU resources of every registered unit.
    pub fn release_gpu(&self, cache: &mut GpuProgramCache) {
        for handle in self.units.values() {
            handle.release_gpu(cache);
        }
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .field("failures", &self.failures.len())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
