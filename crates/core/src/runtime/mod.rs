//! Composition root tying discovery, crossfades, audio and pacing together.
//!
//! The host owns the window and the graphics context. It calls
//! [`Visualiser::render_frame`] (or [`Visualiser::pump`], which lets the
//! [`FrameScheduler`] decide when a frame is due) on the render thread and
//! reads the boundary outputs back: frame rate, errors and the schema of the
//! active unit.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::{PlaylistEntry, PresetLocation};
use crate::timeline::{PhaseClock, Timer};
use crate::transition::TickReport;
use crate::unit::FrameInput;
use crate::{
    AppConfig, AudioSignalSource, FpsCounter, FrameScheduler, GpuBackend, GpuProgramCache,
    PluginLoader, Preset, Result, SchemaField, Surface, TransitionEngine, UnitHandle,
    VisibilityProbe,
};

const DEFAULT_PLAYLIST_INTERVAL_MS: u64 = 30_000;

/// Result of one rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub tick: TickReport,
    /// Set once per elapsed second.
    pub fps: Option<u32>,
}

#[derive(Debug)]
struct Playlist {
    entries: Vec<PlaylistEntry>,
    position: usize,
    timer: Timer,
}

impl Playlist {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            position: 0,
            timer: Timer::new(Duration::from_millis(DEFAULT_PLAYLIST_INTERVAL_MS)),
        }
    }

    fn replace(&mut self, entries: Vec<PlaylistEntry>, interval: Duration, now: Instant) {
        self.entries = entries;
        self.position = 0;
        self.timer = Timer::new(interval);
        if !self.entries.is_empty() {
            self.timer.start(now);
        }
    }
}

pub struct Visualiser {
    config: AppConfig,
    loader: PluginLoader,
    engine: TransitionEngine,
    audio: AudioSignalSource,
    scheduler: FrameScheduler,
    phase: PhaseClock,
    fps: FpsCounter,
    playlist: Playlist,
    background: Option<Value>,
    frame_count: u64,
    last_fps: Option<u32>,
}

impl Visualiser {
    /// Discovers the configured plugin directory and opens the audio input.
    pub fn new(config: AppConfig) -> Self {
        let audio = AudioSignalSource::start(&config.audio);
        Self::with_audio(config, audio)
    }

    pub fn with_audio(config: AppConfig, audio: AudioSignalSource) -> Self {
        let mut loader = PluginLoader::new(&config.plugins);
        let directory = config.plugins.directory.clone();
        if directory.is_dir() {
            if let Err(err) = loader.discover(&directory) {
                tracing::warn!(path = %directory.display(), error = %err, "plugin discovery failed");
            }
        } else {
            tracing::debug!(path = %directory.display(), "no plugin directory, builtin units only");
        }

        let engine = TransitionEngine::new(loader.fallback().clone(), config.render.transition_step);
        let scheduler = FrameScheduler::from_config(&config.render);
        let phase = PhaseClock::new(config.render.phase_step);

        Self {
            config,
            loader,
            engine,
            audio,
            scheduler,
            phase,
            fps: FpsCounter::new(),
            playlist: Playlist::empty(),
            background: None,
            frame_count: 0,
            last_fps: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut PluginLoader {
        &mut self.loader
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    pub fn audio(&self) -> &AudioSignalSource {
        &self.audio
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    /// Opaque background description from the last preset.
    pub fn background(&self) -> Option<&Value> {
        self.background.as_ref()
    }

    /// Program cache for a context owned by the calling thread, with the
    /// configured shader retry policy.
    pub fn program_cache(&self, backend: Box<dyn GpuBackend>) -> GpuProgramCache {
        GpuProgramCache::new(backend).with_retry_after(self.config.render.shader_retry_after_frames)
    }

    /// Identity of the unit that is or will become the only one drawn.
    pub fn active_identity(&self) -> String {
        self.engine.target().identity()
    }

    /// Starts a crossfade to `identity`. Unknown identities fade to the
    /// no-op unit.
    pub fn switch_to(&mut self, identity: &str, now: Instant) -> bool {
        let handle = self.loader.get(identity, now);
        self.switch_to_handle(handle)
    }

    fn switch_to_handle(&mut self, handle: UnitHandle) -> bool {
        let started = self.engine.switch_to(handle);
        if started {
            tracing::info!(unit = %self.active_identity(), "switching unit");
        }
        started
    }

    /// Applies a preset: target unit and its configuration, frame rate,
    /// background and playlist.
    pub fn apply_preset(&mut self, preset: &Preset, now: Instant) {
        if let Some(effect) = preset.effect.as_deref() {
            let handle = self.loader.get(effect, now);
            if !preset.effect_config.is_empty() {
                handle.configure(now, &preset.effect_config);
            }
            self.switch_to_handle(handle);
        }
        self.engine
            .set_background_visible(preset.show_background.unwrap_or(true));

        let fps = preset.fps.unwrap_or(self.config.render.target_fps);
        self.set_target_fps(fps, now);

        if preset.background.is_some() {
            self.background = preset.background.clone();
        }

        let interval = Duration::from_millis(
            preset
                .playlist_interval
                .unwrap_or(DEFAULT_PLAYLIST_INTERVAL_MS)
                .max(1),
        );
        self.playlist
            .replace(preset.effects_playlist.clone(), interval, now);
    }

    /// Loads a preset file or bundle directory. Bundled effects are
    /// discovered before the preset is applied.
    pub fn load_preset(&mut self, path: impl AsRef<Path>, now: Instant) -> Result<()> {
        let location = PresetLocation::resolve(path)?;
        if let Some(effects) = &location.effects_dir {
            let loaded = self.loader.discover(effects)?;
            tracing::info!(path = %effects.display(), loaded, "bundle effects discovered");
        }
        let preset = Preset::load(&location.preset_file)?;
        tracing::info!(path = %location.preset_file.display(), "preset loaded");
        self.apply_preset(&preset, now);
        Ok(())
    }

    pub fn set_target_fps(&mut self, fps: u32, now: Instant) {
        self.scheduler.set_target_fps(fps, now);
    }

    /// Draws one frame onto `surface`.
    pub fn render_frame(&mut self, surface: &mut dyn Surface, now: Instant) -> FrameReport {
        if let Some(cache) = surface.gpu() {
            cache.begin_frame();
        }

        self.phase.advance();
        let frame = FrameInput {
            width: surface.width(),
            height: surface.height(),
            phase: self.phase.phase(),
            audio: self.audio.latest(),
        };
        let tick = self.engine.tick(surface, &frame, now);

        let retired = self.loader.collect_retired(surface.gpu());
        if retired > 0 {
            tracing::debug!(retired, "released replaced unit instances");
        }

        self.frame_count += 1;
        let fps = self.fps.tick(now);
        if fps.is_some() {
            self.last_fps = fps;
        }

        self.rotate_playlist(now);
        FrameReport { tick, fps }
    }

    /// Lets the scheduler poll visibility and draws a frame when one is due.
    /// Returns when to call again.
    pub fn pump(
        &mut self,
        surface: &mut dyn Surface,
        now: Instant,
        probe: &mut dyn VisibilityProbe,
    ) -> (Instant, Option<FrameReport>) {
        let mut due = None;
        let wake = self.scheduler.advance(now, probe, |at| due = Some(at));
        let report = due.map(|at| self.render_frame(surface, at));
        (wake, report)
    }

    fn rotate_playlist(&mut self, now: Instant) {
        if !self.playlist.timer.fire(now) || self.engine.is_transitioning() {
            return;
        }
        let count = self.playlist.entries.len();
        if count == 0 {
            return;
        }

        self.playlist.position = (self.playlist.position + 1) % count;
        let entry = &self.playlist.entries[self.playlist.position];
        let handle = self.loader.get(entry.identity(), now);
        if let Some(config) = entry.config().filter(|config| !config.is_empty()) {
            handle.configure(now, config);
        }
        if handle.ptr_eq(self.engine.target()) {
            return;
        }
        tracing::debug!(position = self.playlist.position, "playlist advanced");
        self.switch_to_handle(handle);
    }

    /// Schema of the unit that is or will become active.
    pub fn active_schema(&self, now: Instant) -> Vec<SchemaField> {
        self.engine.target().config_schema(now)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Most recent frames-per-second figure.
    pub fn fps(&self) -> Option<u32> {
        self.last_fps
    }

    /// Load, reload and compile errors for an external log view.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.loader.errors()
    }

    /// Stops the audio thread, then frees GPU resources while the context is
    /// still current. Plugin sources stay registered.
    pub fn shutdown(&mut self, cache: Option<&mut GpuProgramCache>) {
        self.audio.stop();
        if let Some(cache) = cache {
            self.loader.collect_retired(Some(&mut *cache));
            self.loader.release_gpu(cache);
            self.engine.current().release_gpu(cache);
            if let Some(next) = self.engine.next() {
                next.release_gpu(cache);
            }
            cache.release_all();
        }
        tracing::info!(frames = self.frame_count, "visualiser shut down");
    }
}

impl std::fmt::Debug for Visualiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visualiser")
            .field("active", &self.active_identity())
            .field("transitioning", &self.engine.is_transitioning())
            .field("scheduler", &self.scheduler.state())
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::time::SystemTime;

    use serde_json::json;

    use super::*;
    use crate::render::testing::RecordingBackend;
    use crate::{CaptureState, DisplayList, DrawCommand};

    const INVALID: &str = "\
// @name: broken
#error intentionally invalid
uniform float iTime;
void main() {}
";

    const VORTEX: &str = "\
// @name: vortex
// @param speed float 0.0 10.0 1.0 Speed
uniform float iTime;
uniform float u_speed;
void main() {}
";

    fn rewrite(path: &Path, text: &str, offset: u64) {
        fs::write(path, text).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(offset))
            .unwrap();
    }

    fn config_for(dir: &Path, step: f32) -> AppConfig {
        let mut config = AppConfig::default();
        config.plugins.directory = dir.to_path_buf();
        config.render.transition_step = step;
        config
    }

    fn visualiser(dir: &Path, step: f32) -> Visualiser {
        Visualiser::with_audio(config_for(dir, step), AudioSignalSource::disabled("test"))
    }

    fn settle(visualiser: &mut Visualiser, surface: &mut DisplayList, now: Instant) {
        for _ in 0..8 {
            visualiser.render_frame(surface, now);
        }
        assert!(!visualiser.engine().is_transitioning());
    }

    #[test]
    fn invalid_shader_still_completes_the_transition() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.frag"), INVALID).unwrap();

        let mut visualiser = visualiser(dir.path(), 0.25);
        let (backend, log) = RecordingBackend::new();
        let cache = visualiser.program_cache(Box::new(backend));
        let mut surface = DisplayList::new(64, 64).with_gpu(cache);
        let now = Instant::now();

        visualiser.switch_to("pulse", now);
        settle(&mut visualiser, &mut surface, now);
        surface.take_commands();
        assert!(visualiser.switch_to("broken", now));

        let mut committed = 0;
        for _ in 0..4 {
            if visualiser.render_frame(&mut surface, now).tick.committed {
                committed += 1;
            }
        }
        assert_eq!(committed, 1);
        assert_eq!(visualiser.active_identity(), "broken");

        // Only the raster side of the crossfade produced anything.
        surface.take_commands();
        let report = visualiser.render_frame(&mut surface, now);
        assert_eq!(report.tick.drawn, 1);
        assert!(surface.commands().is_empty());

        let errors = visualiser.errors();
        assert!(errors
            .iter()
            .any(|(identity, message)| identity == "broken" && message.contains("syntax error")));
        let log = log.lock().unwrap();
        assert_eq!(log.compiles, 1);
        assert!(log.draws.is_empty());
    }

    #[test]
    fn corrupt_or_deleted_source_keeps_the_last_good_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vortex.frag");
        fs::write(&path, VORTEX).unwrap();

        let mut visualiser = visualiser(dir.path(), 1.0);
        let (backend, log) = RecordingBackend::new();
        let cache = visualiser.program_cache(Box::new(backend));
        let mut surface = DisplayList::new(64, 64).with_gpu(cache);
        let start = Instant::now();

        visualiser.switch_to("vortex", start);
        visualiser.render_frame(&mut surface, start);
        visualiser
            .engine()
            .current()
            .configure(start, json!({ "speed": 4.0 }).as_object().unwrap());
        assert_eq!(log.lock().unwrap().draws.len(), 1);

        rewrite(&path, "// @param speed float fast\nvoid main() {}\n", 5);
        visualiser.render_frame(&mut surface, start + Duration::from_secs(3));
        assert_eq!(log.lock().unwrap().draws.len(), 2);
        assert!(visualiser
            .errors()
            .iter()
            .any(|(identity, _)| identity == "vortex"));

        fs::remove_file(&path).unwrap();
        visualiser.render_frame(&mut surface, start + Duration::from_secs(6));
        let log = log.lock().unwrap();
        assert_eq!(log.draws.len(), 3);
        assert_eq!(
            log.uniform_named(2, "u_speed"),
            Some(crate::UniformValue::Float(4.0))
        );
        assert_eq!(visualiser.active_identity(), "vortex");
    }

    #[test]
    fn preset_drives_unit_rate_and_background() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualiser = visualiser(dir.path(), 0.5);
        let now = Instant::now();

        let preset = Preset::from_json_str(
            r##"{
                "effect": "pulse",
                "effect_config": { "color": "#ff0000", "size": 0.5 },
                "fps": 30,
                "show_background": false,
                "background": { "type": "color", "value": "#101010" }
            }"##,
        )
        .unwrap();
        visualiser.apply_preset(&preset, now);

        assert_eq!(visualiser.active_identity(), "pulse");
        assert_eq!(visualiser.scheduler().target_fps(), 30);
        assert_eq!(visualiser.background().unwrap()["type"], "color");
        assert!(!visualiser.engine().target().background_visible());
        assert!(visualiser
            .active_schema(now)
            .iter()
            .any(|field| field.key == "size"));
    }

    #[test]
    fn playlist_rotates_between_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualiser = visualiser(dir.path(), 0.5);
        let mut surface = DisplayList::new(32, 32);
        let start = Instant::now();

        let preset = Preset::from_json_str(
            r#"{ "effect": "pulse", "effects_playlist": ["pulse", "gradient"], "playlist_interval": 100 }"#,
        )
        .unwrap();
        visualiser.apply_preset(&preset, start);
        visualiser.render_frame(&mut surface, start);
        assert_eq!(visualiser.active_identity(), "pulse");

        visualiser.render_frame(&mut surface, start + Duration::from_millis(100));
        assert_eq!(visualiser.active_identity(), "gradient");

        // Rotation back to `pulse` waits while a transition is running.
        visualiser.render_frame(&mut surface, start + Duration::from_millis(200));
        assert!(visualiser.engine().is_transitioning());
        assert_eq!(visualiser.active_identity(), "gradient");
    }

    #[test]
    fn bundle_effects_are_discovered_with_the_preset() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        let bundle = dir.path().join("Neon");
        fs::create_dir_all(&plugins).unwrap();
        fs::create_dir_all(bundle.join("effects")).unwrap();
        fs::write(bundle.join("effects").join("vortex.frag"), VORTEX).unwrap();
        fs::write(bundle.join("preset.json"), r#"{ "effect": "vortex", "fps": 12 }"#).unwrap();

        let mut visualiser = visualiser(&plugins, 0.5);
        let now = Instant::now();
        visualiser.load_preset(&bundle, now).unwrap();
        assert!(visualiser.loader().contains("vortex"));
        assert_eq!(visualiser.active_identity(), "vortex");
        assert_eq!(visualiser.scheduler().target_fps(), 12);

        assert!(visualiser.load_preset(dir.path().join("missing"), now).is_err());
    }

    #[test]
    fn frames_feed_the_counters_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualiser = visualiser(dir.path(), 0.5);
        let mut surface = DisplayList::new(16, 16);
        visualiser.switch_to("pulse", Instant::now());

        let start = Instant::now();
        let mut reported = None;
        for frame in 0..=22u64 {
            let report = visualiser.render_frame(&mut surface, start + Duration::from_millis(frame * 50));
            reported = report.fps.or(reported);
        }
        assert_eq!(visualiser.frame_count(), 23);
        assert_eq!(reported, Some(21));
        assert_eq!(visualiser.fps(), Some(21));

        let ellipse_count = surface
            .commands()
            .iter()
            .filter(|command| matches!(command, DrawCommand::FillEllipse { .. }))
            .count();
        assert!(ellipse_count > 0);
    }

    #[test]
    fn pump_draws_only_when_the_scheduler_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualiser = visualiser(dir.path(), 0.5);
        let mut surface = DisplayList::new(16, 16);
        let mut probe = || true;
        let start = Instant::now();

        let (wake, report) = visualiser.pump(&mut surface, start, &mut probe);
        assert!(report.is_none());
        assert!(wake > start);

        let mut now = start;
        while now < start + Duration::from_secs(3) {
            visualiser.pump(&mut surface, now, &mut probe);
            now += Duration::from_millis(10);
        }
        // Frames stop once the first visibility poll reports occlusion.
        assert!(visualiser.frame_count() <= 18);
        let frames = visualiser.frame_count();
        visualiser.pump(&mut surface, now + Duration::from_secs(1), &mut probe);
        assert_eq!(visualiser.frame_count(), frames);
    }

    #[test]
    fn shutdown_stops_audio_and_frees_programs() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualiser = visualiser(dir.path(), 1.0);
        let (backend, log) = RecordingBackend::new();
        let cache = visualiser.program_cache(Box::new(backend));
        let mut surface = DisplayList::new(32, 32).with_gpu(cache);
        let now = Instant::now();

        visualiser.switch_to("gradient", now);
        visualiser.render_frame(&mut surface, now);
        assert_eq!(log.lock().unwrap().live_programs.len(), 1);

        visualiser.shutdown(surface.gpu_cache_mut());
        assert!(log.lock().unwrap().live_programs.is_empty());
        assert!(log.lock().unwrap().live_buffers.is_empty());
        assert!(matches!(visualiser.audio().state(), CaptureState::Disabled(_)));
        assert!(visualiser.loader().contains("gradient"));
    }
}
