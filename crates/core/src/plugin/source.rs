use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use super::native::{NativeLibrary, NativeUnit};
use super::shader_file::{ShaderFile, ShaderFileEffect};
use crate::unit::{FrameInput, SchemaField, ShaderUnit, VisualUnit};
use crate::{ConfigMap, GpuProgramCache, Result, Surface, VisualError};

/// Builds a fresh instance of a compiled-in unit.
pub type UnitFactory = Arc<dyn Fn() -> Box<dyn VisualUnit> + Send + Sync>;

#[derive(Clone)]
pub enum SourceKind {
    Builtin(UnitFactory),
    ShaderFile,
    Native,
}

impl SourceKind {
    /// Kind of a candidate plugin file, by extension.
    pub fn for_path(path: &Path) -> Option<Self> {
        let extension = path.extension().and_then(OsStr::to_str)?.to_ascii_lowercase();
        match extension.as_str() {
            "frag" | "glsl" => Some(Self::ShaderFile),
            ext if ext == std::env::consts::DLL_EXTENSION => Some(Self::Native),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Builtin(_) => "builtin",
            Self::ShaderFile => "shader",
            Self::Native => "native",
        }
    }
}

impl std::fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of a file that declares none: the lowercased stem without a
/// trailing `_effect` / `effect`, and without the platform library prefix
/// for native units.
pub fn derive_identity(path: &Path, kind: &SourceKind) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut name = stem.as_str();
    if matches!(kind, SourceKind::Native) && !std::env::consts::DLL_PREFIX.is_empty() {
        name = name.strip_prefix(std::env::consts::DLL_PREFIX).unwrap_or(name);
    }
    let trimmed = name
        .strip_suffix("_effect")
        .or_else(|| name.strip_suffix("effect"))
        .unwrap_or(name);

    if trimmed.is_empty() {
        stem
    } else {
        trimmed.to_string()
    }
}

/// A file read and validated, ready to produce instances.
enum Opened {
    Shader(ShaderFile),
    Native(Arc<NativeLibrary>),
}

impl Opened {
    fn open(kind: &SourceKind, path: &Path) -> Result<Self> {
        match kind {
            SourceKind::ShaderFile => ShaderFile::load(path).map(Self::Shader),
            SourceKind::Native => NativeLibrary::open(path).map(Self::Native),
            SourceKind::Builtin(_) => Err(VisualError::load(path, "builtin units are not file backed")),
        }
    }

    fn declared_name(&self) -> Option<String> {
        match self {
            Self::Shader(file) => file.name.clone(),
            Self::Native(library) => library.declared_name().map(str::to_string),
        }
    }

    fn instantiate(self, identity: &str) -> Result<Box<dyn VisualUnit>> {
        match self {
            Self::Shader(file) => Ok(Box::new(ShaderUnit::new(identity, ShaderFileEffect::new(file)))),
            Self::Native(library) => Ok(Box::new(NativeUnit::new(identity, library)?)),
        }
    }
}

fn modified_time(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

/// One loadable unit and its reload guard.
///
/// `last_good` is only ever replaced by an instance that constructed
/// successfully; a failed reload leaves it live and records `last_error`.
pub struct PluginSource {
    identity: String,
    declared_name: Option<String>,
    path: Option<PathBuf>,
    kind: SourceKind,
    last_known_modified: Option<SystemTime>,
    last_failed_modified: Option<SystemTime>,
    last_good: Box<dyn VisualUnit>,
    last_error: Option<String>,
    source_missing: bool,
    cooldown: Duration,
    last_check: Option<Instant>,
    applied_config: ConfigMap,
    retired: Vec<Box<dyn VisualUnit>>,
    generation: u64,
}

impl PluginSource {
    pub fn builtin(identity: &str, factory: UnitFactory, cooldown: Duration) -> Self {
        let unit = factory();
        Self {
            identity: identity.to_string(),
            declared_name: Some(identity.to_string()),
            path: None,
            kind: SourceKind::Builtin(factory),
            last_known_modified: None,
            last_failed_modified: None,
            last_good: unit,
            last_error: None,
            source_missing: false,
            cooldown,
            last_check: None,
            applied_config: ConfigMap::new(),
            retired: Vec::new(),
            generation: 0,
        }
    }

    /// First load of a file. `manifest_identity` wins over a name declared
    /// inside the file, which wins over the derived name.
    pub fn load(
        path: &Path,
        kind: SourceKind,
        manifest_identity: Option<&str>,
        cooldown: Duration,
        now: Instant,
    ) -> Result<Self> {
        let modified = modified_time(path).map_err(|err| VisualError::load(path, err.to_string()))?;
        let opened = Opened::open(&kind, path)?;

        let declared_name = manifest_identity
            .map(str::to_string)
            .or_else(|| opened.declared_name());
        let identity = declared_name
            .clone()
            .unwrap_or_else(|| derive_identity(path, &kind));
        let unit = opened
            .instantiate(&identity)
            .map_err(|err| VisualError::load(path, err.to_string()))?;

        Ok(Self {
            identity,
            declared_name,
            path: Some(path.to_path_buf()),
            kind,
            last_known_modified: Some(modified),
            last_failed_modified: None,
            last_good: unit,
            last_error: None,
            source_missing: false,
            cooldown,
            last_check: Some(now),
            applied_config: ConfigMap::new(),
            retired: Vec::new(),
            generation: 0,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn declared_name(&self) -> Option<&str> {
        self.declared_name.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn last_known_modified(&self) -> Option<SystemTime> {
        self.last_known_modified
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of successful reloads.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn unit(&mut self) -> &mut dyn VisualUnit {
        self.last_good.as_mut()
    }

    fn cooldown_elapsed(&mut self, now: Instant) -> bool {
        match self.last_check {
            Some(last) if now.saturating_duration_since(last) < self.cooldown => false,
            _ => {
                self.last_check = Some(now);
                true
            }
        }
    }

    /// Reloads when the file on disk is newer than the live instance. Checks
    /// are rate limited by the cooldown, whether or not they reload. Returns
    /// `true` when a new instance was swapped in.
    pub fn refresh(&mut self, now: Instant) -> bool {
        let Some(path) = self.path.clone() else {
            return false;
        };
        if !self.cooldown_elapsed(now) {
            return false;
        }

        let modified = match modified_time(&path) {
            Ok(modified) => modified,
            Err(err) => {
                self.mark_missing(&path, &err);
                return false;
            }
        };
        if self.source_missing {
            self.source_missing = false;
            self.last_error = None;
        }

        let newer = self.last_known_modified.map_or(true, |known| modified > known);
        if !newer || self.last_failed_modified == Some(modified) {
            return false;
        }
        self.swap_in_rebuild(Some(modified)).is_ok()
    }

    /// Rebuilds the unit regardless of modification time. Returns
    /// `Ok(false)` when the cooldown has not elapsed yet.
    pub fn reload(&mut self, now: Instant) -> Result<bool> {
        if !self.cooldown_elapsed(now) {
            return Ok(false);
        }
        let modified = match &self.path {
            Some(path) => match modified_time(path) {
                Ok(modified) => Some(modified),
                Err(err) => {
                    let path = path.clone();
                    self.mark_missing(&path, &err);
                    return Err(VisualError::PluginReload {
                        identity: self.identity.clone(),
                        reason: err.to_string(),
                    });
                }
            },
            None => None,
        };
        self.swap_in_rebuild(modified).map(|()| true)
    }

    fn mark_missing(&mut self, path: &Path, err: &std::io::Error) {
        let message = format!("source unavailable: {err}");
        if self.last_error.as_deref() != Some(message.as_str()) {
            tracing::warn!(
                identity = %self.identity,
                path = %path.display(),
                %err,
                "plugin source unavailable, keeping the running instance"
            );
        }
        self.source_missing = true;
        self.last_error = Some(message);
    }

    fn rebuild(&self) -> Result<Box<dyn VisualUnit>> {
        let path = match (&self.kind, &self.path) {
            (SourceKind::Builtin(factory), _) => return Ok(factory()),
            (_, Some(path)) => path,
            (_, None) => return Err(VisualError::msg("file backed unit without a path")),
        };

        let opened = Opened::open(&self.kind, path)?;
        if let Some(name) = opened.declared_name() {
            if self.declared_name.as_deref() != Some(name.as_str()) {
                tracing::debug!(
                    identity = %self.identity,
                    declared = %name,
                    "declared name changed on disk; identity is kept until the next discovery"
                );
            }
        }
        opened.instantiate(&self.identity)
    }

    fn swap_in_rebuild(&mut self, modified: Option<SystemTime>) -> Result<()> {
        match self.rebuild() {
            Ok(mut unit) => {
                unit.set_background_visible(self.last_good.background_visible());
                if !self.applied_config.is_empty() {
                    unit.configure(&self.applied_config);
                }
                let previous = std::mem::replace(&mut self.last_good, unit);
                self.retired.push(previous);

                self.last_known_modified = modified.or(self.last_known_modified);
                self.last_failed_modified = None;
                self.last_error = None;
                self.generation += 1;
                tracing::info!(
                    identity = %self.identity,
                    generation = self.generation,
                    kind = self.kind.label(),
                    "unit reloaded"
                );
                Ok(())
            }
            Err(err) => {
                self.last_failed_modified = modified;
                let err = VisualError::PluginReload {
                    identity: self.identity.clone(),
                    reason: err.to_string(),
                };
                tracing::warn!(identity = %self.identity, %err, "reload failed, keeping the running instance");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn configure(&mut self, config: &ConfigMap) {
        for (key, value) in config {
            self.applied_config.insert(key.clone(), value.clone());
        }
        self.last_good.configure(config);
    }

    /// Drops instances replaced by reloads, freeing their GPU programs first
    /// when a cache is available.
    pub fn collect_retired(&mut self, mut cache: Option<&mut GpuProgramCache>) -> usize {
        let collected = self.retired.len();
        for mut unit in self.retired.drain(..) {
            if let Some(cache) = cache.as_deref_mut() {
                unit.release_gpu(cache);
            }
        }
        collected
    }

    pub fn release_gpu(&mut self, cache: &mut GpuProgramCache) {
        self.collect_retired(Some(cache));
        self.last_good.release_gpu(cache);
    }
}

impl std::fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSource")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("generation", &self.generation)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Shared reference to a registered [`PluginSource`].
///
/// Every operation first gives the source a chance to pick up edits on disk,
/// then forwards to the live instance. Two handles are the same unit when
/// they point at the same source.
#[derive(Clone)]
pub struct UnitHandle(Arc<Mutex<PluginSource>>);

impl UnitHandle {
    pub fn new(source: PluginSource) -> Self {
        Self(Arc::new(Mutex::new(source)))
    }

    /// A panic inside a unit poisons the lock; the source itself stays
    /// consistent because instances are only ever swapped whole.
    fn lock(&self) -> MutexGuard<'_, PluginSource> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn identity(&self) -> String {
        self.lock().identity.clone()
    }

    pub fn with_source<R>(&self, f: impl FnOnce(&mut PluginSource) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn refresh(&self, now: Instant) -> bool {
        self.lock().refresh(now)
    }

    pub fn reload(&self, now: Instant) -> Result<bool> {
        self.lock().reload(now)
    }

    pub fn configure(&self, now: Instant, config: &ConfigMap) {
        let mut source = self.lock();
        source.refresh(now);
        source.configure(config);
    }

    pub fn draw(&self, now: Instant, surface: &mut dyn Surface, frame: &FrameInput) -> Result<()> {
        let mut source = self.lock();
        source.refresh(now);
        source.last_good.draw(surface, frame)
    }

    pub fn config_schema(&self, now: Instant) -> Vec<SchemaField> {
        let mut source = self.lock();
        source.refresh(now);
        source.last_good.config_schema()
    }

    pub fn background_visible(&self) -> bool {
        self.lock().last_good.background_visible()
    }

    pub fn set_background_visible(&self, visible: bool) {
        self.lock().last_good.set_background_visible(visible);
    }

    /// The source's reload error, or the live instance's own sticky error.
    pub fn last_error(&self) -> Option<String> {
        let source = self.lock();
        source
            .last_error
            .clone()
            .or_else(|| source.last_good.last_error().map(str::to_string))
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn collect_retired(&self, cache: Option<&mut GpuProgramCache>) -> usize {
        self.lock().collect_retired(cache)
    }

    pub fn release_gpu(&self, cache: &mut GpuProgramCache) {
        self.lock().release_gpu(cache);
    }
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.lock(), f)
    }
}
