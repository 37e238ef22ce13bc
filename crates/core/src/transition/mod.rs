//! Crossfade between the active unit and the next one.

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::plugin::UnitHandle;
use crate::unit::FrameInput;
use crate::{Surface, VisualError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    Idle,
    Active,
}

#[derive(Debug, Clone)]
struct Transition {
    from: UnitHandle,
    to: UnitHandle,
    alpha: f32,
}

/// What one [`TransitionEngine::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub drawn: usize,
    pub failed: usize,
    /// The transition finished on this tick.
    pub committed: bool,
}

/// Holds the active unit and, while switching, the unit fading in.
#[derive(Debug)]
pub struct TransitionEngine {
    current: UnitHandle,
    transition: Option<Transition>,
    step: f32,
}

impl TransitionEngine {
    pub fn new(initial: UnitHandle, step: f32) -> Self {
        Self {
            current: initial,
            transition: None,
            step: sanitize_step(step),
        }
    }

    pub fn mode(&self) -> TransitionMode {
        if self.transition.is_some() {
            TransitionMode::Active
        } else {
            TransitionMode::Idle
        }
    }

    pub fn is_transitioning(&self) -> bool {
        self.transition.is_some()
    }

    pub fn alpha(&self) -> Option<f32> {
        self.transition.as_ref().map(|transition| transition.alpha)
    }

    /// The unit drawn at full opacity when idle, or fading out otherwise.
    pub fn current(&self) -> &UnitHandle {
        &self.current
    }

    /// The unit fading in, if a transition is running.
    pub fn next(&self) -> Option<&UnitHandle> {
        self.transition.as_ref().map(|transition| &transition.to)
    }

    /// The unit that is or will be the sole active one.
    pub fn target(&self) -> &UnitHandle {
        self.next().unwrap_or(&self.current)
    }

    pub fn set_step(&mut self, step: f32) {
        self.step = sanitize_step(step);
    }

    /// Starts fading to `next`. While a transition is running, its target
    /// becomes the unit fading out and the previous one is dropped. Returns
    /// `false` when `next` is already the target.
    pub fn switch_to(&mut self, next: UnitHandle) -> bool {
        if next.ptr_eq(self.target()) {
            return false;
        }

        if let Some(previous) = self.transition.take() {
            self.current = previous.to;
        }
        next.set_background_visible(self.current.background_visible());
        tracing::debug!(from = %self.current.identity(), to = %next.identity(), "transition started");
        self.transition = Some(Transition {
            from: self.current.clone(),
            to: next,
            alpha: 0.0,
        });
        true
    }

    /// Applies the background flag to every unit the engine holds.
    pub fn set_background_visible(&mut self, visible: bool) {
        self.current.set_background_visible(visible);
        if let Some(transition) = &self.transition {
            transition.to.set_background_visible(visible);
        }
    }

    /// Advances the crossfade by one step and draws. Both units of a running
    /// transition receive the same `frame`. A unit whose draw fails or panics
    /// is skipped for this tick only.
    pub fn tick(&mut self, surface: &mut dyn Surface, frame: &FrameInput, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        if let Some(transition) = &mut self.transition {
            transition.alpha = (transition.alpha + self.step).min(1.0);
            if transition.alpha >= 1.0 {
                if let Some(finished) = self.transition.take() {
                    self.current = finished.to;
                    report.committed = true;
                    tracing::debug!(unit = %self.current.identity(), "transition committed");
                }
            }
        }

        match &self.transition {
            Some(transition) => {
                draw_unit(&transition.from, surface, frame, now, 1.0 - transition.alpha, &mut report);
                draw_unit(&transition.to, surface, frame, now, transition.alpha, &mut report);
            }
            None => draw_unit(&self.current, surface, frame, now, 1.0, &mut report),
        }
        surface.set_opacity(1.0);
        report
    }
}

fn sanitize_step(step: f32) -> f32 {
    if step.is_finite() && step > 0.0 {
        step.min(1.0)
    } else {
        1.0
    }
}

fn draw_unit(
    handle: &UnitHandle,
    surface: &mut dyn Surface,
    frame: &FrameInput,
    now: Instant,
    opacity: f32,
    report: &mut TickReport,
) {
    surface.set_opacity(opacity);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handle.draw(now, surface, frame)));
    let err = match outcome {
        Ok(Ok(())) => {
            report.drawn += 1;
            return;
        }
        Ok(Err(err)) => err,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panicked".to_string());
            VisualError::draw(handle.identity(), reason)
        }
    };
    report.failed += 1;
    tracing::warn!(unit = %handle.identity(), %err, "draw failed, skipping unit for this frame");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::plugin::{PluginSource, UnitFactory};
    use crate::unit::{RasterEffect, RasterUnit, VisualUnit};
    use crate::{AudioSnapshot, Color, ConfigMap, DisplayList, DrawCommand, Rect, Result};

    /// Fills the surface with its color and counts draws.
    struct Fill {
        color: Color,
        draws: Arc<AtomicUsize>,
        fail: bool,
    }

    impl RasterEffect for Fill {
        fn configure(&mut self, _config: &ConfigMap) {}

        fn paint(&mut self, surface: &mut dyn Surface, frame: &FrameInput, _background: bool) -> Result<()> {
            self.draws.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                panic!("fill exploded");
            }
            surface.fill_rect(Rect::from_size(frame.width, frame.height), self.color);
            Ok(())
        }
    }

    fn unit(identity: &'static str, color: Color, fail: bool) -> (UnitHandle, Arc<AtomicUsize>) {
        let draws = Arc::new(AtomicUsize::new(0));
        let counter = draws.clone();
        let factory: UnitFactory = Arc::new(move || {
            Box::new(RasterUnit::new(
                identity,
                Fill {
                    color,
                    draws: counter.clone(),
                    fail,
                },
            )) as Box<dyn VisualUnit>
        });
        let source = PluginSource::builtin(identity, factory, Duration::from_secs(2));
        (UnitHandle::new(source), draws)
    }

    fn frame() -> FrameInput {
        FrameInput {
            width: 10,
            height: 10,
            phase: 0.25,
            audio: AudioSnapshot::new(0.1, 0.2, 0.3),
        }
    }

    fn fills(surface: &mut DisplayList) -> Vec<(Color, f32)> {
        surface
            .take_commands()
            .into_iter()
            .filter_map(|command| match command {
                DrawCommand::FillRect { color, opacity, .. } => Some((color, opacity)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn idle_draws_the_single_unit_at_full_opacity() {
        let (a, _) = unit("a", Color::WHITE, false);
        let mut engine = TransitionEngine::new(a, 0.015);
        let mut surface = DisplayList::new(10, 10);

        let report = engine.tick(&mut surface, &frame(), Instant::now());
        assert_eq!(report.drawn, 1);
        assert_eq!(fills(&mut surface), vec![(Color::WHITE, 1.0)]);
        assert_eq!(engine.mode(), TransitionMode::Idle);
    }

    #[test]
    fn crossfade_draws_both_with_complementary_opacity() {
        let (a, _) = unit("a", Color::WHITE, false);
        let (b, _) = unit("b", Color::BLACK, false);
        let mut engine = TransitionEngine::new(a, 0.25);
        assert!(engine.switch_to(b));

        let mut surface = DisplayList::new(10, 10);
        engine.tick(&mut surface, &frame(), Instant::now());
        assert_eq!(fills(&mut surface), vec![(Color::WHITE, 0.75), (Color::BLACK, 0.25)]);
        assert_eq!(surface.opacity(), 1.0);
    }

    #[test]
    fn alpha_rises_monotonically_and_commits_exactly_at_one() {
        for step in [0.015_f32, 0.1, 0.3, 0.5, 1.0] {
            let (a, _) = unit("a", Color::WHITE, false);
            let (b, _) = unit("b", Color::BLACK, false);
            let mut engine = TransitionEngine::new(a, step);
            engine.switch_to(b.clone());

            let mut surface = DisplayList::new(10, 10);
            let mut last = 0.0;
            let mut commits = 0;
            for _ in 0..200 {
                let report = engine.tick(&mut surface, &frame(), Instant::now());
                match engine.alpha() {
                    Some(alpha) => {
                        assert!((0.0..1.0).contains(&alpha), "alpha {alpha} out of range");
                        assert!(alpha >= last);
                        last = alpha;
                        assert!(!report.committed);
                    }
                    None => {
                        if report.committed {
                            commits += 1;
                        }
                    }
                }
            }
            assert_eq!(commits, 1, "step {step}");
            assert!(engine.current().ptr_eq(&b));
            assert_eq!(engine.mode(), TransitionMode::Idle);
        }
    }

    #[test]
    fn switching_mid_transition_promotes_the_target() {
        let (a, _) = unit("a", Color::WHITE, false);
        let (b, _) = unit("b", Color::BLACK, false);
        let (c, _) = unit("c", Color::rgb(1, 2, 3), false);
        let mut engine = TransitionEngine::new(a, 0.1);
        engine.switch_to(b.clone());
        let mut surface = DisplayList::new(10, 10);
        engine.tick(&mut surface, &frame(), Instant::now());

        assert!(!engine.switch_to(b.clone()));
        assert!(engine.switch_to(c.clone()));
        assert!(engine.current().ptr_eq(&b));
        assert!(engine.next().unwrap().ptr_eq(&c));
        assert_eq!(engine.alpha(), Some(0.0));
    }

    #[test]
    fn switching_to_the_current_unit_is_ignored() {
        let (a, _) = unit("a", Color::WHITE, false);
        let mut engine = TransitionEngine::new(a.clone(), 0.1);
        assert!(!engine.switch_to(a));
        assert!(!engine.is_transitioning());
    }

    #[test]
    fn next_unit_inherits_the_background_flag() {
        let (a, _) = unit("a", Color::WHITE, false);
        let (b, _) = unit("b", Color::BLACK, false);
        a.set_background_visible(false);
        let mut engine = TransitionEngine::new(a, 0.1);
        engine.switch_to(b.clone());
        assert!(!b.background_visible());
    }

    #[test]
    fn a_panicking_unit_is_skipped_without_stopping_the_other() {
        let (a, a_draws) = unit("a", Color::WHITE, false);
        let (b, b_draws) = unit("b", Color::BLACK, true);
        let mut engine = TransitionEngine::new(a, 0.5);
        engine.switch_to(b.clone());

        let mut surface = DisplayList::new(10, 10);
        let report = engine.tick(&mut surface, &frame(), Instant::now());
        assert_eq!((report.drawn, report.failed), (1, 1));
        assert_eq!(fills(&mut surface), vec![(Color::WHITE, 0.5)]);

        let report = engine.tick(&mut surface, &frame(), Instant::now());
        assert!(report.committed);
        assert_eq!(report.failed, 1);
        assert!(engine.current().ptr_eq(&b));
        assert_eq!(a_draws.load(Ordering::SeqCst), 1);
        assert_eq!(b_draws.load(Ordering::SeqCst), 2);

        // The failing unit is not retired; it keeps being asked to draw.
        engine.tick(&mut surface, &frame(), Instant::now());
        assert_eq!(b_draws.load(Ordering::SeqCst), 3);
    }
}
