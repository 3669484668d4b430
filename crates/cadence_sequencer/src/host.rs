// SPDX-License-Identifier: MIT OR Apache-2.0
//! Effect hosts.
//!
//! An [`EffectHost`] performs the actual effect of a unit. The unit tells it
//! where to stop next with [`EffectHost::run_to`]; the host advances its
//! playhead over the unit's local timeline and holds at that point until it
//! gets a new one.
//!
//! [`ClockHost`] is a reference host driven by the tokio clock. It renders
//! frame mutators at every stop and records what it was asked to do, which
//! a [`ClockProbe`] exposes for inspection.

use crate::config::Composite;
use crate::effect::ResolvedEffect;
use crate::error::FinalizeError;
use crate::keyframe::{sample, KeyframeValue};
use crate::timing::{Direction, PhaseLayout, EPSILON};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

/// Timing handed to a host at the start of a traversal
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostTiming {
    /// Forward delay (ms)
    pub delay: f64,
    /// Active phase length (ms)
    pub duration: f64,
    /// Forward end delay (ms)
    pub end_delay: f64,
    /// Easing name
    pub easing: String,
    /// Composite operation
    pub composite: Composite,
}

impl HostTiming {
    /// Phase geometry of a traversal in the given direction
    pub fn layout(&self, direction: Direction) -> PhaseLayout {
        PhaseLayout::new(direction, self.delay, self.duration, self.end_delay)
    }
}

/// Where a host's playhead is
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostProgress {
    /// Traversal direction
    pub direction: Direction,
    /// Local position from the start of the traversal (ms)
    pub position: f64,
    /// Progress through the active phase in the traversal direction (0..=1)
    pub progress: f64,
}

impl HostProgress {
    /// Fraction of the forward tween that is currently shown
    pub fn tween_fraction(&self) -> f64 {
        match self.direction {
            Direction::Forward => self.progress,
            Direction::Backward => 1.0 - self.progress,
        }
    }
}

/// Performs a unit's effect
pub trait EffectHost {
    /// Set timing for the next traversal
    fn set_timing(&mut self, timing: &HostTiming);

    /// Set the direction and move the playhead to that traversal's start
    fn set_direction(&mut self, direction: Direction);

    /// Set the playback rate
    fn set_playback_rate(&mut self, rate: f64);

    /// Install effect content for a direction
    fn apply_effect(&mut self, direction: Direction, effect: ResolvedEffect);

    /// Start or resume advancing
    fn play(&mut self);

    /// Stop advancing
    fn pause(&mut self);

    /// Stop and drop the current effect
    fn cancel(&mut self);

    /// Jump to the current stop point
    fn finish(&mut self);

    /// Advance up to `stop` and resolve once the playhead is there
    fn run_to(&mut self, stop: f64) -> LocalBoxFuture<'static, ()>;

    /// Current playhead
    fn progress(&self) -> HostProgress;

    /// Persist the effect's end state on the target
    fn commit_final_state(&mut self, forceful: bool) -> Result<(), FinalizeError>;

    /// Show or hide the target
    fn set_presence(&mut self, _visible: bool) {}
}

#[derive(Debug, Clone)]
struct Playhead {
    direction: Direction,
    position: f64,
    anchor: Option<Instant>,
    stop: f64,
    rate: f64,
    skew: f64,
}

impl Playhead {
    fn current(&self, now: Instant) -> f64 {
        let advanced = match self.anchor {
            Some(anchor) => {
                let elapsed = now.saturating_duration_since(anchor).as_secs_f64() * 1000.0;
                self.position + elapsed * self.rate * self.skew
            }
            None => self.position,
        };
        advanced.min(self.stop.max(self.position))
    }

    fn rebase(&mut self, now: Instant) {
        self.position = self.current(now);
        if self.anchor.is_some() {
            self.anchor = Some(now);
        }
    }

    /// Wall time until the playhead reaches `target`, if it is moving
    fn time_to(&self, target: f64, now: Instant) -> Option<Duration> {
        self.anchor?;
        let remaining = (target - self.current(now)).max(0.0) / (self.rate * self.skew);
        Some(Duration::from_micros((remaining * 1000.0).ceil() as u64))
    }
}

#[derive(Debug, Default)]
struct HostRecord {
    timing: HostTiming,
    presence: Option<bool>,
    effects: [Option<ResolvedEffect>; 2],
    effects_applied: usize,
    commit_attempts: Vec<bool>,
    failing_commits: usize,
    last_progress: Option<f64>,
}

impl HostRecord {
    fn progress_at(&self, direction: Direction, position: f64) -> f64 {
        let layout = self.timing.layout(direction);
        if layout.active <= 0.0 {
            return if position >= layout.delay { 1.0 } else { 0.0 };
        }
        ((position - layout.delay) / layout.active).clamp(0.0, 1.0)
    }
}

/// Reference host on the tokio clock
#[derive(Debug)]
pub struct ClockHost {
    playhead: watch::Sender<Playhead>,
    record: Rc<RefCell<HostRecord>>,
}

impl Default for ClockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockHost {
    /// Create a paused host at the start of a forward traversal
    pub fn new() -> Self {
        let (playhead, _) = watch::channel(Playhead {
            direction: Direction::Forward,
            position: 0.0,
            anchor: None,
            stop: 0.0,
            rate: 1.0,
            skew: 1.0,
        });
        Self {
            playhead,
            record: Rc::new(RefCell::new(HostRecord::default())),
        }
    }

    /// Run faster (or slower) than the requested rate
    pub fn with_skew(self, skew: f64) -> Self {
        self.playhead.send_modify(|p| p.skew = skew);
        self
    }

    /// Make the next `count` commit attempts fail
    pub fn with_failing_commits(self, count: usize) -> Self {
        self.record.borrow_mut().failing_commits = count;
        self
    }

    /// Create a probe that observes this host
    pub fn probe(&self) -> ClockProbe {
        ClockProbe {
            playhead: self.playhead.subscribe(),
            record: Rc::clone(&self.record),
        }
    }
}

impl EffectHost for ClockHost {
    fn set_timing(&mut self, timing: &HostTiming) {
        self.record.borrow_mut().timing = timing.clone();
    }

    fn set_direction(&mut self, direction: Direction) {
        let now = Instant::now();
        self.playhead.send_modify(|p| {
            p.direction = direction;
            p.position = 0.0;
            p.stop = 0.0;
            if p.anchor.is_some() {
                p.anchor = Some(now);
            }
        });
    }

    fn set_playback_rate(&mut self, rate: f64) {
        let now = Instant::now();
        self.playhead.send_modify(|p| {
            p.rebase(now);
            p.rate = rate;
        });
    }

    fn apply_effect(&mut self, direction: Direction, effect: ResolvedEffect) {
        let mut record = self.record.borrow_mut();
        record.effects[direction.index()] = Some(effect);
        record.effects_applied += 1;
    }

    fn play(&mut self) {
        let now = Instant::now();
        self.playhead.send_if_modified(|p| {
            if p.anchor.is_some() {
                return false;
            }
            p.anchor = Some(now);
            true
        });
    }

    fn pause(&mut self) {
        let now = Instant::now();
        self.playhead.send_modify(|p| {
            p.rebase(now);
            p.anchor = None;
        });
    }

    fn cancel(&mut self) {
        self.playhead.send_modify(|p| {
            p.anchor = None;
            p.position = 0.0;
            p.stop = 0.0;
        });
        self.record.borrow_mut().effects = [None, None];
    }

    fn finish(&mut self) {
        let now = Instant::now();
        self.playhead.send_modify(|p| {
            p.rebase(now);
            p.position = p.position.max(p.stop);
        });
    }

    fn run_to(&mut self, stop: f64) -> LocalBoxFuture<'static, ()> {
        let now = Instant::now();
        self.playhead.send_modify(|p| {
            p.rebase(now);
            p.stop = stop;
        });
        let mut playhead = self.playhead.subscribe();
        let record = Rc::clone(&self.record);

        async move {
            loop {
                let wait = {
                    let p = playhead.borrow_and_update();
                    let now = Instant::now();
                    if p.current(now) >= stop - EPSILON {
                        break;
                    }
                    p.time_to(stop, now)
                };
                match wait {
                    Some(duration) => tokio::select! {
                        biased;
                        changed = playhead.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = sleep(duration) => {}
                    },
                    None => {
                        if playhead.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }

            let direction = playhead.borrow().direction;
            render(&record, direction, stop);
        }
        .boxed_local()
    }

    fn progress(&self) -> HostProgress {
        let playhead = self.playhead.borrow();
        let position = playhead.current(Instant::now());
        HostProgress {
            direction: playhead.direction,
            position,
            progress: self.record.borrow().progress_at(playhead.direction, position),
        }
    }

    fn commit_final_state(&mut self, forceful: bool) -> Result<(), FinalizeError> {
        let mut record = self.record.borrow_mut();
        record.commit_attempts.push(forceful);
        if record.failing_commits > 0 {
            record.failing_commits -= 1;
            return Err(FinalizeError::new("target rejected the end state"));
        }
        Ok(())
    }

    fn set_presence(&mut self, visible: bool) {
        self.record.borrow_mut().presence = Some(visible);
    }
}

/// Draw the frame at `position`: remember the progress and feed any mutator
fn render(record: &Rc<RefCell<HostRecord>>, direction: Direction, position: f64) {
    let mutator = {
        let mut record = record.borrow_mut();
        let progress = record.progress_at(direction, position);
        record.last_progress = Some(progress);
        match &record.effects[direction.index()] {
            Some(ResolvedEffect::Mutator(mutator)) => Some((Rc::clone(mutator), progress)),
            _ => None,
        }
    };
    if let Some((mutator, progress)) = mutator {
        mutator(progress);
    }
}

/// Read-only view of a [`ClockHost`]
#[derive(Debug, Clone)]
pub struct ClockProbe {
    playhead: watch::Receiver<Playhead>,
    record: Rc<RefCell<HostRecord>>,
}

impl ClockProbe {
    /// Local playhead position (ms)
    pub fn position(&self) -> f64 {
        self.playhead.borrow().current(Instant::now())
    }

    /// Direction of the current traversal
    pub fn direction(&self) -> Direction {
        self.playhead.borrow().direction
    }

    /// Whether the playhead is advancing
    pub fn is_playing(&self) -> bool {
        self.playhead.borrow().anchor.is_some()
    }

    /// Last presence set by a kind hook
    pub fn presence(&self) -> Option<bool> {
        self.record.borrow().presence
    }

    /// Timing of the current traversal
    pub fn timing(&self) -> HostTiming {
        self.record.borrow().timing.clone()
    }

    /// Number of `apply_effect` calls so far
    pub fn effects_applied(&self) -> usize {
        self.record.borrow().effects_applied
    }

    /// Effect installed for a direction
    pub fn applied_effect(&self, direction: Direction) -> Option<ResolvedEffect> {
        self.record.borrow().effects[direction.index()].clone()
    }

    /// `forceful` flag of every commit attempt, in order
    pub fn commit_attempts(&self) -> Vec<bool> {
        self.record.borrow().commit_attempts.clone()
    }

    /// Active-phase progress drawn at the last stop
    pub fn last_progress(&self) -> Option<f64> {
        self.record.borrow().last_progress
    }

    /// Keyframe value drawn at the last stop
    pub fn sampled_value(&self) -> Option<KeyframeValue> {
        let direction = self.direction();
        let record = self.record.borrow();
        let progress = record.last_progress?;
        let frames = record.effects[direction.index()].as_ref()?.keyframes()?;
        sample(frames, progress as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::Keyframe;

    fn timing(duration: f64) -> HostTiming {
        HostTiming {
            duration,
            ..HostTiming::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_to_waits_for_the_clock() {
        let mut host = ClockHost::new();
        host.set_timing(&timing(200.0));
        host.play();

        let start = Instant::now();
        host.run_to(200.0).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(202));
        assert_eq!(host.progress().progress, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_rate_scales_wall_time() {
        let mut host = ClockHost::new();
        host.set_timing(&timing(200.0));
        host.set_playback_rate(2.0);
        host.play();

        let start = Instant::now();
        host.run_to(200.0).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(102));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_host_holds_position() {
        let mut host = ClockHost::new();
        host.set_timing(&timing(100.0));
        let probe = host.probe();
        let arrival = host.run_to(100.0);

        let outcome = tokio::time::timeout(Duration::from_millis(500), arrival).await;
        assert!(outcome.is_err());
        assert_eq!(probe.position(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_jumps_to_stop() {
        let mut host = ClockHost::new();
        host.set_timing(&timing(1000.0));
        let arrival = host.run_to(1000.0);
        host.finish();

        let start = Instant::now();
        arrival.await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(host.progress().position, 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playhead_holds_at_stop() {
        let mut host = ClockHost::new();
        host.set_timing(&timing(100.0));
        host.play();
        host.run_to(40.0).await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(host.progress().position, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_samples_direction_effect() {
        let mut host = ClockHost::new();
        let probe = host.probe();
        host.set_timing(&timing(100.0));
        host.set_direction(Direction::Backward);
        host.apply_effect(
            Direction::Backward,
            ResolvedEffect::Keyframes(
                vec![
                    Keyframe::new(0.0, KeyframeValue::Float(1.0)),
                    Keyframe::new(1.0, KeyframeValue::Float(0.0)),
                ]
                .into(),
            ),
        );
        host.play();
        host.run_to(25.0).await;

        assert_eq!(probe.last_progress(), Some(0.25));
        assert_eq!(probe.sampled_value(), Some(KeyframeValue::Float(0.75)));
        assert_eq!(host.progress().tween_fraction(), 0.75);
    }

    #[test]
    fn test_scripted_commit_failures() {
        let mut host = ClockHost::new().with_failing_commits(1);
        let probe = host.probe();
        assert!(host.commit_final_state(false).is_err());
        assert!(host.commit_final_state(true).is_ok());
        assert_eq!(probe.commit_attempts(), vec![false, true]);
    }
}
