use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::frame_interval;
use crate::RenderConfig;

/// Animation phase in `[0, 1)`, advanced by a fixed step per rendered frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseClock {
    phase: f32,
    step: f32,
}

impl PhaseClock {
    pub fn new(step: f32) -> Self {
        Self {
            phase: 0.0,
            step: if step.is_finite() { step } else { 0.0 },
        }
    }

    pub fn phase(&self) -> f32 {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    pub fn advance(&mut self) -> f32 {
        let next = (self.phase + self.step).rem_euclid(1.0);
        self.phase = if next >= 1.0 { 0.0 } else { next };
        self.phase
    }
}

/// Frames rendered per elapsed second.
#[derive(Debug, Clone, Default)]
pub struct FpsCounter {
    frames: u32,
    window_start: Option<Instant>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one frame. Returns the frame count once at least a second has
    /// passed since the last report.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        if now.saturating_duration_since(start) >= Duration::from_secs(1) {
            let fps = self.frames;
            self.frames = 0;
            self.window_start = Some(now);
            Some(fps)
        } else {
            None
        }
    }
}

/// Periodic deadline. A stopped timer never fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    interval: Duration,
    next: Option<Instant>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_active(&self) -> bool {
        self.next.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next
    }

    pub fn start(&mut self, now: Instant) {
        self.next = Some(now + self.interval);
    }

    pub fn start_immediately(&mut self, now: Instant) {
        self.next = Some(now);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    /// Changes the interval; an active timer is re-armed from `now`.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval.max(Duration::from_millis(1));
        if self.is_active() {
            self.start(now);
        }
    }

    /// Fires at most once per call. Missed periods are skipped rather than
    /// replayed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.next {
            Some(deadline) if now >= deadline => {
                let next = deadline + self.interval;
                self.next = Some(if next <= now { now + self.interval } else { next });
                true
            }
            _ => false,
        }
    }
}

/// Reports whether the render surface is fully covered by other content.
pub trait VisibilityProbe {
    fn is_occluded(&mut self) -> bool;
}

impl<F: FnMut() -> bool> VisibilityProbe for F {
    fn is_occluded(&mut self) -> bool {
        self()
    }
}

/// Probe for surfaces that are never hidden.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysVisible;

impl VisibilityProbe for AlwaysVisible {
    fn is_occluded(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Paused,
}

/// Drives frame callbacks at a target rate and pauses them while the
/// surface is occluded.
///
/// Two timers run side by side: the frame timer, which is stopped entirely
/// while paused, and a slower visibility timer that polls the probe in both
/// states.
#[derive(Debug, Clone)]
pub struct FrameScheduler {
    state: SchedulerState,
    target_fps: u32,
    frame_timer: Timer,
    visibility_timer: Timer,
    started: bool,
    frames: u64,
}

impl FrameScheduler {
    pub fn new(target_fps: u32, visibility_interval: Duration) -> Self {
        let target_fps = target_fps.max(1);
        Self {
            state: SchedulerState::Running,
            target_fps,
            frame_timer: Timer::new(frame_interval(target_fps)),
            visibility_timer: Timer::new(visibility_interval),
            started: false,
            frames: 0,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.target_fps, config.visibility_interval())
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn frame_interval(&self) -> Duration {
        self.frame_timer.interval()
    }

    pub fn visibility_interval(&self) -> Duration {
        self.visibility_timer.interval()
    }

    /// Frame callbacks issued so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn start(&mut self, now: Instant) {
        self.started = true;
        self.visibility_timer.start(now);
        if self.state == SchedulerState::Running {
            self.frame_timer.start(now);
        }
    }

    /// Re-arms only the frame timer; the visibility poll and everything the
    /// frame callback owns are left alone.
    pub fn set_target_fps(&mut self, fps: u32, now: Instant) {
        self.target_fps = fps.max(1);
        self.frame_timer.set_interval(frame_interval(self.target_fps), now);
        tracing::debug!(fps = self.target_fps, "target frame rate changed");
    }

    /// Runs whatever is due at `now` and returns when to call again.
    pub fn advance<F>(&mut self, now: Instant, probe: &mut dyn VisibilityProbe, mut on_frame: F) -> Instant
    where
        F: FnMut(Instant),
    {
        if !self.started {
            self.start(now);
        }

        if self.visibility_timer.fire(now) {
            let occluded = probe.is_occluded();
            match (self.state, occluded) {
                (SchedulerState::Running, true) => {
                    self.state = SchedulerState::Paused;
                    self.frame_timer.stop();
                    tracing::info!("surface occluded, pausing frames");
                }
                (SchedulerState::Paused, false) => {
                    self.state = SchedulerState::Running;
                    self.frame_timer.start_immediately(now);
                    tracing::info!("surface visible, resuming frames");
                }
                _ => {}
            }
        }

        if self.state == SchedulerState::Running && self.frame_timer.fire(now) {
            self.frames += 1;
            on_frame(now);
        }

        [self.frame_timer.deadline(), self.visibility_timer.deadline()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + self.visibility_timer.interval())
    }

    /// Blocking loop on the calling thread until `stop` is set.
    pub fn run<F>(&mut self, stop: &AtomicBool, probe: &mut dyn VisibilityProbe, mut on_frame: F)
    where
        F: FnMut(Instant),
    {
        while !stop.load(Ordering::Relaxed) {
            let wake = self.advance(Instant::now(), probe, &mut on_frame);
            let pause = wake.saturating_duration_since(Instant::now());
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    const TICK: Duration = Duration::from_millis(5);

    /// Steps `scheduler` from `start` for `span` in small increments and
    /// returns the instants at which frames fired.
    fn drive(
        scheduler: &mut FrameScheduler,
        probe: &mut dyn VisibilityProbe,
        start: Instant,
        span: Duration,
    ) -> Vec<Instant> {
        let mut fired = Vec::new();
        let mut now = start;
        while now < start + span {
            scheduler.advance(now, probe, |at| fired.push(at));
            now += TICK;
        }
        fired
    }

    #[test]
    fn frames_fire_at_the_target_rate() {
        let mut scheduler = FrameScheduler::new(20, Duration::from_millis(800));
        let fired = drive(&mut scheduler, &mut AlwaysVisible, Instant::now(), Duration::from_secs(1));
        assert!((19..=20).contains(&fired.len()), "fired {}", fired.len());
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn occluded_surface_issues_no_frames() {
        let polls = Rc::new(Cell::new(0u32));
        let seen = polls.clone();
        let mut probe = move || {
            seen.set(seen.get() + 1);
            true
        };

        let mut scheduler = FrameScheduler::new(22, Duration::from_millis(800));
        let start = Instant::now();
        let mut frames_after_pause = 0;
        let mut now = start;
        while now < start + Duration::from_secs(8) {
            scheduler.advance(now, &mut probe, |_| {
                if polls.get() > 0 {
                    frames_after_pause += 1;
                }
            });
            now += TICK;
        }

        assert!(polls.get() >= 9);
        assert_eq!(frames_after_pause, 0);
        assert_eq!(scheduler.state(), SchedulerState::Paused);
    }

    #[test]
    fn frames_resume_within_one_poll_of_visibility() {
        let occluded = Rc::new(Cell::new(true));
        let flag = occluded.clone();
        let mut probe = move || flag.get();

        let mut scheduler = FrameScheduler::new(22, Duration::from_millis(800));
        let start = Instant::now();
        let paused = drive(&mut scheduler, &mut probe, start, Duration::from_secs(2));
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(paused.iter().all(|at| *at < start + Duration::from_millis(800)));

        occluded.set(false);
        let visible_at = start + Duration::from_secs(2);
        let resumed = drive(&mut scheduler, &mut probe, visible_at, Duration::from_secs(1));
        let first = resumed.first().copied().unwrap();
        assert!(first - visible_at <= Duration::from_millis(800));
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn changing_the_rate_rearms_only_the_frame_timer() {
        let mut scheduler = FrameScheduler::new(10, Duration::from_millis(800));
        let start = Instant::now();
        scheduler.start(start);
        let poll = scheduler.visibility_timer.deadline();

        let later = start + Duration::from_millis(30);
        scheduler.set_target_fps(50, later);
        assert_eq!(scheduler.frame_interval(), Duration::from_millis(20));
        assert_eq!(scheduler.frame_timer.deadline(), Some(later + Duration::from_millis(20)));
        assert_eq!(scheduler.visibility_timer.deadline(), poll);
    }

    #[test]
    fn rate_changes_while_paused_do_not_restart_frames() {
        let mut probe = || true;
        let mut scheduler = FrameScheduler::new(22, Duration::from_millis(100));
        let start = Instant::now();
        drive(&mut scheduler, &mut probe, start, Duration::from_millis(200));
        scheduler.set_target_fps(60, start + Duration::from_millis(200));
        assert!(!scheduler.frame_timer.is_active());
    }

    #[test]
    fn timers_skip_missed_periods() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(10));
        timer.start(start);
        assert!(!timer.fire(start));
        assert!(timer.fire(start + Duration::from_millis(95)));
        assert!(!timer.fire(start + Duration::from_millis(96)));
        assert_eq!(timer.deadline(), Some(start + Duration::from_millis(105)));
    }

    #[test]
    fn fps_counter_reports_once_per_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new();
        let mut reports = Vec::new();
        for frame in 0..=44 {
            if let Some(fps) = counter.tick(start + Duration::from_millis(frame * 50)) {
                reports.push(fps);
            }
        }
        assert_eq!(reports, vec![21, 20]);
    }

    #[test]
    fn phase_wraps_into_unit_interval() {
        let mut clock = PhaseClock::new(0.3);
        let phases: Vec<f32> = (0..4).map(|_| clock.advance()).collect();
        assert!(phases.iter().all(|phase| (0.0..1.0).contains(phase)));
        assert!(phases[3] < phases[2]);
    }
}
