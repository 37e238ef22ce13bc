//! GPU program ownership for shader units.
//!
//! Shader units never touch graphics handles themselves. They hold a
//! [`ProgramKey`] and ask the render thread's [`GpuProgramCache`] to draw with
//! it; the cache compiles on first use, remembers failures and frees every
//! handle it created. All resource operations assert that they run on the
//! thread that created the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::{Result, VisualError};

/// Two-triangle strip covering clip space.
pub const FULLSCREEN_QUAD: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

static NEXT_PROGRAM_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique key of one shader unit instance's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramKey(u64);

impl ProgramKey {
    pub fn next() -> Self {
        Self(NEXT_PROGRAM_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Backend-specific program handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u32);

/// Backend-specific vertex buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Backend-specific uniform location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Int(i32),
}

/// Vertex and fragment stage sources of one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSources {
    pub label: String,
    pub vertex: String,
    pub fragment: String,
}

/// Graphics API operations the cache needs. Implementations are only ever
/// called from the render thread.
pub trait GpuBackend {
    /// Compiles and links both stages, returning the info log on failure.
    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
    ) -> std::result::Result<ProgramHandle, String>;

    /// Uploads `vertices` (pairs of clip-space floats) bound to the
    /// program's `position` attribute.
    fn create_vertex_buffer(
        &mut self,
        program: ProgramHandle,
        vertices: &[f32],
    ) -> std::result::Result<BufferHandle, String>;

    /// `None` when the program does not declare (or optimised away) `name`.
    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformHandle>;

    /// Binds the program and uniforms, and draws the buffer as a triangle
    /// strip blended at `opacity`.
    fn draw_strip(
        &mut self,
        program: ProgramHandle,
        buffer: BufferHandle,
        uniforms: &[(UniformHandle, UniformValue)],
        opacity: f32,
    );

    fn delete_program(&mut self, program: ProgramHandle);
    fn delete_buffer(&mut self, buffer: BufferHandle);
}

/// Compilation state of one unit's program.
#[derive(Debug, Clone)]
pub struct GpuProgramEntry {
    pub label: String,
    pub source_text: String,
    pub program: Option<ProgramHandle>,
    pub vertex_buffer: Option<BufferHandle>,
    pub compiled: bool,
    pub compile_error: Option<String>,
    failed_at_frame: Option<u64>,
    uniforms: HashMap<String, Option<UniformHandle>>,
}

impl GpuProgramEntry {
    fn new(sources: &ShaderSources) -> Self {
        Self {
            label: sources.label.clone(),
            source_text: sources.fragment.clone(),
            program: None,
            vertex_buffer: None,
            compiled: false,
            compile_error: None,
            failed_at_frame: None,
            uniforms: HashMap::new(),
        }
    }

    fn attempted(&self) -> bool {
        self.compiled || self.failed_at_frame.is_some()
    }
}

/// What a cache draw did this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Drawn,
    /// The program is not usable; nothing was drawn.
    Blank,
}

/// Owns every program and buffer created for shader units.
pub struct GpuProgramCache {
    owner: ThreadId,
    backend: Box<dyn GpuBackend>,
    entries: HashMap<ProgramKey, GpuProgramEntry>,
    frame: u64,
    retry_after_frames: Option<u64>,
}

impl GpuProgramCache {
    /// Creates a cache bound to the calling thread, which must own the
    /// graphics context behind `backend`.
    pub fn new(backend: Box<dyn GpuBackend>) -> Self {
        Self {
            owner: thread::current().id(),
            backend,
            entries: HashMap::new(),
            frame: 0,
            retry_after_frames: None,
        }
    }

    /// Lets failed programs compile again after `frames` frames.
    pub fn with_retry_after(mut self, frames: Option<u64>) -> Self {
        self.retry_after_frames = frames;
        self
    }

    #[cfg(test)]
    pub(crate) fn owned_by(mut self, owner: ThreadId) -> Self {
        self.owner = owner;
        self
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn assert_owner(&self) {
        assert!(
            self.is_owner_thread(),
            "GPU resources may only be touched on the render thread that owns the context"
        );
    }

    /// Advances the frame counter used by the retry policy.
    pub fn begin_frame(&mut self) {
        self.frame += 1;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn entry(&self, key: ProgramKey) -> Option<&GpuProgramEntry> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Draws the program behind `key` over the whole surface, compiling it
    /// first if this is its first use.
    ///
    /// A failed compilation is reported once, as
    /// [`VisualError::ShaderCompile`]; later calls return
    /// [`DrawOutcome::Blank`] without compiling again unless the retry policy
    /// allows it. Uniforms the program does not declare are skipped.
    pub fn draw(
        &mut self,
        key: ProgramKey,
        sources: &ShaderSources,
        uniforms: &[(&str, UniformValue)],
        opacity: f32,
    ) -> Result<DrawOutcome> {
        self.assert_owner();

        let frame = self.frame;
        let retry_after = self.retry_after_frames;
        let backend = &mut self.backend;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| GpuProgramEntry::new(sources));

        let retry_due = match (entry.failed_at_frame, retry_after) {
            (Some(failed), Some(after)) => frame >= failed + after,
            _ => false,
        };

        if !entry.attempted() || retry_due {
            if let Err(log) = compile_entry(backend.as_mut(), entry, sources, frame) {
                return Err(VisualError::ShaderCompile {
                    unit: entry.label.clone(),
                    log,
                });
            }
        }

        let (Some(program), Some(buffer)) = (entry.program, entry.vertex_buffer) else {
            return Ok(DrawOutcome::Blank);
        };

        let mut resolved = Vec::with_capacity(uniforms.len());
        for (name, value) in uniforms {
            let location = *entry
                .uniforms
                .entry((*name).to_string())
                .or_insert_with(|| backend.uniform_location(program, name));
            if let Some(location) = location {
                resolved.push((location, *value));
            }
        }

        backend.draw_strip(program, buffer, &resolved, opacity.clamp(0.0, 1.0));
        Ok(DrawOutcome::Drawn)
    }

    /// Frees the handles behind `key`.
    pub fn release(&mut self, key: ProgramKey) {
        self.assert_owner();
        if let Some(entry) = self.entries.remove(&key) {
            free_entry(self.backend.as_mut(), entry);
        }
    }

    /// Frees every handle. Must run before the graphics context goes away.
    pub fn release_all(&mut self) {
        self.assert_owner();
        let released = self.entries.len();
        for (_, entry) in self.entries.drain() {
            free_entry(self.backend.as_mut(), entry);
        }
        if released > 0 {
            tracing::debug!(released, "released GPU programs");
        }
    }
}

impl Drop for GpuProgramCache {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        if self.is_owner_thread() {
            self.release_all();
        } else {
            tracing::warn!(
                leaked = self.entries.len(),
                "GPU program cache dropped off the render thread"
            );
        }
    }
}

impl std::fmt::Debug for GpuProgramCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuProgramCache")
            .field("owner", &self.owner)
            .field("entries", &self.entries.len())
            .field("frame", &self.frame)
            .finish()
    }
}

fn compile_entry(
    backend: &mut dyn GpuBackend,
    entry: &mut GpuProgramEntry,
    sources: &ShaderSources,
    frame: u64,
) -> std::result::Result<(), String> {
    let outcome = backend
        .compile_program(&sources.vertex, &sources.fragment)
        .and_then(|program| {
            match backend.create_vertex_buffer(program, &FULLSCREEN_QUAD) {
                Ok(buffer) => Ok((program, buffer)),
                Err(err) => {
                    backend.delete_program(program);
                    Err(err)
                }
            }
        });

    match outcome {
        Ok((program, buffer)) => {
            entry.program = Some(program);
            entry.vertex_buffer = Some(buffer);
            entry.compiled = true;
            entry.compile_error = None;
            entry.failed_at_frame = None;
            entry.uniforms.clear();
            tracing::debug!(unit = %entry.label, "shader program compiled");
            Ok(())
        }
        Err(log) => {
            entry.compiled = false;
            entry.compile_error = Some(log.clone());
            entry.failed_at_frame = Some(frame);
            Err(log)
        }
    }
}

fn free_entry(backend: &mut dyn GpuBackend, entry: GpuProgramEntry) {
    if let Some(buffer) = entry.vertex_buffer {
        backend.delete_buffer(buffer);
    }
    if let Some(program) = entry.program {
        backend.delete_program(program);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Everything a [`RecordingBackend`] was asked to do.
    #[derive(Debug, Default)]
    pub(crate) struct GpuLog {
        pub compiles: usize,
        pub draws: Vec<(ProgramHandle, Vec<(UniformHandle, UniformValue)>, f32)>,
        pub live_programs: Vec<ProgramHandle>,
        pub live_buffers: Vec<BufferHandle>,
        pub uniform_names: HashMap<u32, String>,
    }

    /// Fake backend: a fragment compiles when it has a `main` and no
    /// `#error` directive; only uniforms mentioned in the source resolve.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub log: Arc<Mutex<GpuLog>>,
        next: u32,
        sources: HashMap<u32, String>,
    }

    impl RecordingBackend {
        pub fn new() -> (Self, Arc<Mutex<GpuLog>>) {
            let backend = Self::default();
            let log = backend.log.clone();
            (backend, log)
        }

        fn id(&mut self) -> u32 {
            self.next += 1;
            self.next
        }
    }

    impl GpuBackend for RecordingBackend {
        fn compile_program(
            &mut self,
            _vertex: &str,
            fragment: &str,
        ) -> std::result::Result<ProgramHandle, String> {
            self.log.lock().unwrap().compiles += 1;
            if !fragment.contains("void main") || fragment.contains("#error") {
                return Err("0:1: syntax error".to_string());
            }
            let id = self.id();
            self.sources.insert(id, fragment.to_string());
            self.log.lock().unwrap().live_programs.push(ProgramHandle(id));
            Ok(ProgramHandle(id))
        }

        fn create_vertex_buffer(
            &mut self,
            _program: ProgramHandle,
            vertices: &[f32],
        ) -> std::result::Result<BufferHandle, String> {
            assert_eq!(vertices.len(), 8);
            let id = self.id();
            self.log.lock().unwrap().live_buffers.push(BufferHandle(id));
            Ok(BufferHandle(id))
        }

        fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformHandle> {
            let declared = self
                .sources
                .get(&program.0)
                .is_some_and(|source| source.contains(&format!(" {name};")));
            if !declared {
                return None;
            }
            let id = self.id();
            self.log
                .lock()
                .unwrap()
                .uniform_names
                .insert(id, name.to_string());
            Some(UniformHandle(id))
        }

        fn draw_strip(
            &mut self,
            program: ProgramHandle,
            _buffer: BufferHandle,
            uniforms: &[(UniformHandle, UniformValue)],
            opacity: f32,
        ) {
            self.log
                .lock()
                .unwrap()
                .draws
                .push((program, uniforms.to_vec(), opacity));
        }

        fn delete_program(&mut self, program: ProgramHandle) {
            self.log
                .lock()
                .unwrap()
                .live_programs
                .retain(|live| *live != program);
        }

        fn delete_buffer(&mut self, buffer: BufferHandle) {
            self.log
                .lock()
                .unwrap()
                .live_buffers
                .retain(|live| *live != buffer);
        }
    }

    impl GpuLog {
        pub fn uniform_named(&self, draw: usize, name: &str) -> Option<UniformValue> {
            self.draws.get(draw).and_then(|(_, uniforms, _)| {
                uniforms
                    .iter()
                    .find(|(handle, _)| self.uniform_names.get(&handle.0).map(String::as_str) == Some(name))
                    .map(|(_, value)| *value)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingBackend;
    use super::*;

    fn sources(fragment: &str) -> ShaderSources {
        ShaderSources {
            label: "test".to_string(),
            vertex: "void main() {}".to_string(),
            fragment: fragment.to_string(),
        }
    }

    const GOOD: &str = "uniform float iTime;\nvoid main() {}";

    #[test]
    fn compiles_once_and_draws_every_frame() {
        let (backend, log) = RecordingBackend::new();
        let mut cache = GpuProgramCache::new(Box::new(backend));
        let key = ProgramKey::next();

        for _ in 0..3 {
            let outcome = cache
                .draw(key, &sources(GOOD), &[("iTime", UniformValue::Float(1.0))], 1.0)
                .unwrap();
            assert_eq!(outcome, DrawOutcome::Drawn);
        }

        let log = log.lock().unwrap();
        assert_eq!(log.compiles, 1);
        assert_eq!(log.draws.len(), 3);
        assert_eq!(log.uniform_named(0, "iTime"), Some(UniformValue::Float(1.0)));
        assert!(cache.entry(key).unwrap().compiled);
    }

    #[test]
    fn undeclared_uniforms_are_skipped() {
        let (backend, log) = RecordingBackend::new();
        let mut cache = GpuProgramCache::new(Box::new(backend));
        let key = ProgramKey::next();

        cache
            .draw(
                key,
                &sources(GOOD),
                &[
                    ("iTime", UniformValue::Float(0.5)),
                    ("iAudio", UniformValue::Vec3([0.1, 0.2, 0.3])),
                ],
                1.0,
            )
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.draws[0].1.len(), 1);
        assert_eq!(log.uniform_named(0, "iAudio"), None);
    }

    #[test]
    fn failed_programs_stay_blank_without_recompiling() {
        let (backend, log) = RecordingBackend::new();
        let mut cache = GpuProgramCache::new(Box::new(backend));
        let key = ProgramKey::next();
        let broken = sources("#error nope\nvoid main() {}");

        let err = cache.draw(key, &broken, &[], 1.0).unwrap_err();
        assert!(matches!(err, VisualError::ShaderCompile { .. }));

        for _ in 0..5 {
            cache.begin_frame();
            assert_eq!(cache.draw(key, &broken, &[], 1.0).unwrap(), DrawOutcome::Blank);
        }

        let entry = cache.entry(key).unwrap();
        assert!(!entry.compiled);
        assert!(entry.compile_error.as_deref().unwrap().contains("syntax error"));
        let log = log.lock().unwrap();
        assert_eq!(log.compiles, 1);
        assert!(log.draws.is_empty());
    }

    #[test]
    fn retry_policy_recompiles_after_the_configured_frames() {
        let (backend, log) = RecordingBackend::new();
        let mut cache = GpuProgramCache::new(Box::new(backend)).with_retry_after(Some(2));
        let key = ProgramKey::next();
        let broken = sources("#error nope\nvoid main() {}");

        assert!(cache.draw(key, &broken, &[], 1.0).is_err());
        cache.begin_frame();
        assert_eq!(cache.draw(key, &broken, &[], 1.0).unwrap(), DrawOutcome::Blank);
        cache.begin_frame();
        assert!(cache.draw(key, &broken, &[], 1.0).is_err());
        assert_eq!(log.lock().unwrap().compiles, 2);
    }

    #[test]
    fn release_frees_all_handles() {
        let (backend, log) = RecordingBackend::new();
        let mut cache = GpuProgramCache::new(Box::new(backend));
        let first = ProgramKey::next();
        let second = ProgramKey::next();
        cache.draw(first, &sources(GOOD), &[], 1.0).unwrap();
        cache.draw(second, &sources(GOOD), &[], 1.0).unwrap();

        cache.release(first);
        assert_eq!(log.lock().unwrap().live_programs.len(), 1);
        cache.release_all();
        let log = log.lock().unwrap();
        assert!(log.live_programs.is_empty());
        assert!(log.live_buffers.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn resource_calls_off_the_owner_thread_panic() {
        let (backend, _log) = RecordingBackend::new();
        let other = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let mut cache = GpuProgramCache::new(Box::new(backend)).owned_by(other);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.draw(ProgramKey::next(), &sources(GOOD), &[], 1.0)
        }));
        assert!(result.is_err());
        assert!(!cache.is_owner_thread());
    }
}
