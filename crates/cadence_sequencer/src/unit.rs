// SPDX-License-Identifier: MIT OR Apache-2.0
//! The unit: one effect driven through delay, active and end-delay phases.
//!
//! A traversal is a loop over *stops*: phase ends plus every registered
//! roadblock, integrity block and time promise, resolved against the phase
//! layout of the traversal direction. The unit asks its host to run to the
//! nearest stop, and on arrival:
//!
//! 1. waits for integrity blocks (stopping only its own host),
//! 2. waits for roadblocks (pausing its root),
//! 3. handles phase ends (effect generation, kind hooks, finalization,
//!    caller hooks),
//! 4. resolves time promises up to the stop.
//!
//! Nothing runs unless the [`PlaybackFuture`] returned by `play()` or
//! `rewind()` is polled.

use crate::blocker::{Blocker, TimePromise};
use crate::config::{UnitConfig, UnitConfigPatch};
use crate::effect::{EffectGenerator, EffectPlan};
use crate::error::{
    ConfigurationError, EffectError, HookFailure, OwnershipError, Result, SequencerError,
    StructuralError,
};
use crate::host::{EffectHost, HostTiming};
use crate::kind::{EffectKind, HookContext, KindHook, KindTag};
use crate::scheduler::{SchedulerId, SchedulerInner};
use crate::timing::{Direction, Phase, PhaseLayout, Position, EPSILON};
use futures::channel::oneshot;
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw counter value
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U{}", self.0)
    }
}

/// Future of one traversal (or of a forced finish)
pub type PlaybackFuture = LocalBoxFuture<'static, Result<()>>;

/// Caller hook fired when a phase finishes
pub type PhaseHook = Box<dyn FnMut(&PhaseEvent) -> std::result::Result<(), HookFailure>>;

/// A finished phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseEvent {
    /// Unit whose phase finished
    pub unit: UnitId,
    /// Traversal direction
    pub direction: Direction,
    /// Phase that finished
    pub phase: Phase,
    /// Local position of the boundary (ms)
    pub position: f64,
}

/// Status flags of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    /// A traversal has started and not completed
    pub in_progress: bool,
    /// In progress and not paused
    pub is_running: bool,
    /// In progress and paused
    pub is_paused: bool,
    /// Direction of the current (or last) traversal
    pub direction: Direction,
    /// Current phase, while in progress
    pub phase: Option<Phase>,
}

/// Configured and derived timing of a unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitTiming {
    /// Active phase length (ms)
    pub duration: f64,
    /// Delay phase length (ms)
    pub delay: f64,
    /// End-delay phase length (ms)
    pub end_delay: f64,
    /// Own playback rate
    pub playback_rate: f64,
    /// Starts together with the previous unit
    pub starts_with_previous: bool,
    /// Makes the next unit start together with this one
    pub starts_next_unit_too: bool,
    /// Own rate times the owner's rate
    pub compounded_playback_rate: f64,
    /// Start of the delay phase on the owner's timeline
    pub full_start_time: f64,
    /// Start of the active phase on the owner's timeline
    pub active_start_time: f64,
    /// End of the active phase on the owner's timeline
    pub active_finish_time: f64,
    /// End of the end-delay phase on the owner's timeline
    pub full_finish_time: f64,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    phase: Phase,
    position: Position,
}

impl Mark {
    fn resolve(&self, layout: &PhaseLayout) -> f64 {
        layout.resolve_clamped(self.phase, self.position)
    }
}

#[derive(Default)]
struct Marks {
    roadblocks: Vec<(Mark, Blocker)>,
    integrity: Vec<(Mark, Blocker)>,
    promises: Vec<(Mark, oneshot::Sender<()>)>,
    hooks: Vec<(Phase, PhaseHook)>,
}

impl Marks {
    fn positions(&self, layout: &PhaseLayout) -> Vec<f64> {
        self.roadblocks
            .iter()
            .chain(self.integrity.iter())
            .map(|(mark, _)| mark.resolve(layout))
            .chain(self.promises.iter().map(|(mark, _)| mark.resolve(layout)))
            .collect()
    }
}

/// Whether `position` lies after `passed` and no later than `stop`
fn within(passed: Option<f64>, stop: f64, position: f64) -> bool {
    passed.map_or(true, |p| position > p + EPSILON) && position <= stop + EPSILON
}

pub(crate) struct UnitInner {
    id: UnitId,
    kind: EffectKind,
    target: String,
    config: RefCell<UnitConfig>,
    plan: EffectPlan,
    host: RefCell<Box<dyn EffectHost>>,
    lineage: RefCell<Option<(SchedulerId, Weak<SchedulerInner>)>>,
    full_start_time: Cell<f64>,

    in_progress: Cell<bool>,
    is_running: Cell<bool>,
    is_paused: Cell<bool>,
    /// Stopped at an integrity block. Independent of pausing.
    held: Cell<bool>,
    using_finish: Cell<bool>,
    direction: Cell<Direction>,
    phase: Cell<Phase>,
    passed: Cell<Option<f64>>,

    marks: [RefCell<Marks>; 2],
    marks_changed: Notify,
    completed: watch::Sender<u64>,
}

/// Handle to a unit
#[derive(Clone)]
pub struct Unit {
    inner: Rc<UnitInner>,
}

/// Builds a [`Unit`]
#[must_use]
pub struct UnitBuilder {
    kind: KindTag,
    generator: EffectGenerator,
    target: String,
    patches: Vec<UnitConfigPatch>,
}

impl UnitBuilder {
    /// Label of the target handed to the host
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Override configuration. Later overrides win.
    pub fn config(mut self, patch: UnitConfigPatch) -> Self {
        self.patches.push(patch);
        self
    }

    /// Create the unit
    pub fn build(self, host: impl EffectHost + 'static) -> std::result::Result<Unit, ConfigurationError> {
        let kind = self.kind.descriptor();
        let mut config = UnitConfig::default();
        config.apply(&kind.defaults);
        for patch in &self.patches {
            config.apply(patch);
        }
        config.apply(&kind.immutable);
        let config = config.validated()?;

        let id = UnitId::next();
        debug!(unit = %id, kind = kind.tag.name(), target = %self.target, "Unit created");

        let (completed, _) = watch::channel(0);
        Ok(Unit {
            inner: Rc::new(UnitInner {
                id,
                kind,
                target: self.target,
                config: RefCell::new(config),
                plan: EffectPlan::new(self.generator),
                host: RefCell::new(Box::new(host)),
                lineage: RefCell::new(None),
                full_start_time: Cell::new(0.0),
                in_progress: Cell::new(false),
                is_running: Cell::new(false),
                is_paused: Cell::new(false),
                held: Cell::new(false),
                using_finish: Cell::new(false),
                direction: Cell::new(Direction::Forward),
                phase: Cell::new(Phase::Delay),
                passed: Cell::new(None),
                marks: [RefCell::default(), RefCell::default()],
                marks_changed: Notify::new(),
                completed,
            }),
        })
    }
}

impl Unit {
    /// Start building a unit of the given kind
    pub fn builder(kind: KindTag, generator: EffectGenerator) -> UnitBuilder {
        UnitBuilder {
            kind,
            generator,
            target: String::new(),
            patches: Vec::new(),
        }
    }

    /// Get the unit's id
    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    /// Get the unit's kind
    pub fn kind(&self) -> KindTag {
        self.inner.kind.tag
    }

    /// Get the target label
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Get the owning scheduler, if any
    pub fn parent(&self) -> Option<SchedulerId> {
        self.inner.owner()
    }

    /// Get the effective configuration
    pub fn config(&self) -> UnitConfig {
        self.inner.config.borrow().clone()
    }

    /// Play forward. A no-op if already in progress.
    pub fn play(&self) -> Result<PlaybackFuture> {
        self.authorize(None)?;
        Ok(self.inner.start(Direction::Forward))
    }

    /// Play backward. A no-op if already in progress.
    pub fn rewind(&self) -> Result<PlaybackFuture> {
        self.authorize(None)?;
        Ok(self.inner.start(Direction::Backward))
    }

    /// Pause while running
    pub fn pause(&self) -> Result<()> {
        self.authorize(None)?;
        self.inner.suspend();
        Ok(())
    }

    /// Resume while paused
    pub fn unpause(&self) -> Result<()> {
        self.authorize(None)?;
        self.inner.resume();
        Ok(())
    }

    /// Fast-forward to the end of the traversal, still honoring roadblocks.
    ///
    /// A no-op while paused. An idle unit starts a traversal in its last
    /// direction first; the returned future then drives that traversal.
    /// Otherwise it resolves once the running traversal completes.
    pub fn finish(&self) -> Result<PlaybackFuture> {
        self.authorize(None)?;
        Ok(self.inner.finish())
    }

    pub(crate) fn play_owned(&self, token: SchedulerId) -> Result<PlaybackFuture> {
        self.authorize(Some(token))?;
        Ok(self.inner.start(Direction::Forward))
    }

    pub(crate) fn rewind_owned(&self, token: SchedulerId) -> Result<PlaybackFuture> {
        self.authorize(Some(token))?;
        Ok(self.inner.start(Direction::Backward))
    }

    pub(crate) fn pause_owned(&self, token: SchedulerId) -> Result<()> {
        self.authorize(Some(token))?;
        self.inner.suspend();
        Ok(())
    }

    pub(crate) fn unpause_owned(&self, token: SchedulerId) -> Result<()> {
        self.authorize(Some(token))?;
        self.inner.resume();
        Ok(())
    }

    pub(crate) fn finish_owned(&self, token: SchedulerId) -> Result<()> {
        self.authorize(Some(token))?;
        if self.inner.in_progress.get() {
            self.inner.force_finish();
        }
        Ok(())
    }

    fn authorize(&self, token: Option<SchedulerId>) -> std::result::Result<(), OwnershipError> {
        match self.inner.owner() {
            Some(owner) if token != Some(owner) => Err(OwnershipError::Bypassed {
                unit: self.id(),
                owner,
            }),
            _ => Ok(()),
        }
    }

    /// Resolve when a traversal in `direction` reaches `position` within `phase`.
    ///
    /// Resolves immediately if the running traversal has already passed that point.
    pub fn generate_time_promise(
        &self,
        direction: Direction,
        phase: Phase,
        position: Position,
    ) -> std::result::Result<TimePromise, ConfigurationError> {
        let inner = &self.inner;
        let target = inner.layout(direction).resolve(phase, position)?;

        let passed = inner.in_progress.get()
            && inner.direction.get() == direction
            && inner.passed.get().is_some_and(|p| p >= target - EPSILON);
        if passed {
            return Ok(TimePromise::ready());
        }

        let (sender, promise) = TimePromise::channel();
        inner.marks[direction.index()]
            .borrow_mut()
            .promises
            .push((Mark { phase, position }, sender));
        inner.marks_changed.notify_one();
        Ok(promise)
    }

    /// Hold playback at a point until every blocker resolves.
    ///
    /// Roadblocks apply to every traversal in `direction`. While waiting the
    /// unit's root (its scheduler, or the unit itself) is paused. A blocker
    /// that never resolves stalls playback for good.
    pub fn add_roadblocks(
        &self,
        direction: Direction,
        phase: Phase,
        position: Position,
        blockers: impl IntoIterator<Item = Blocker>,
    ) -> std::result::Result<(), ConfigurationError> {
        self.inner.layout(direction).resolve(phase, position)?;
        let mark = Mark { phase, position };
        self.inner.marks[direction.index()]
            .borrow_mut()
            .roadblocks
            .extend(blockers.into_iter().map(|blocker| (mark, blocker)));
        self.inner.marks_changed.notify_one();
        Ok(())
    }

    /// Like roadblocks, but one-shot: cleared when the traversal completes,
    /// and only the unit itself pauses while waiting.
    pub(crate) fn add_integrity_blocks(
        &self,
        direction: Direction,
        phase: Phase,
        position: Position,
        blockers: impl IntoIterator<Item = Blocker>,
    ) -> std::result::Result<(), ConfigurationError> {
        self.inner.layout(direction).resolve(phase, position)?;
        let mark = Mark { phase, position };
        self.inner.marks[direction.index()]
            .borrow_mut()
            .integrity
            .extend(blockers.into_iter().map(|blocker| (mark, blocker)));
        self.inner.marks_changed.notify_one();
        Ok(())
    }

    /// Register a hook fired when `phase` finishes during traversals in `direction`
    pub fn on_phase_finish(
        &self,
        direction: Direction,
        phase: Phase,
        hook: impl FnMut(&PhaseEvent) -> std::result::Result<(), HookFailure> + 'static,
    ) {
        self.inner.marks[direction.index()]
            .borrow_mut()
            .hooks
            .push((phase, Box::new(hook)));
    }

    /// Map an instant of the owner's timeline onto the backward traversal
    pub fn backward_point_at(&self, time: f64) -> (Phase, Position) {
        let timing = self.timing();
        let rate = timing.compounded_playback_rate;
        let offset = |from: f64, length: f64| Position::Offset(((from - time) * rate).clamp(0.0, length));

        if time >= timing.active_finish_time {
            (Phase::Delay, offset(timing.full_finish_time, timing.end_delay))
        } else if time >= timing.active_start_time {
            (Phase::Active, offset(timing.active_finish_time, timing.duration))
        } else {
            (Phase::EndDelay, offset(timing.active_start_time, timing.delay))
        }
    }

    /// Change configuration while idle
    pub fn set_config(&self, patch: &UnitConfigPatch) -> Result<()> {
        let inner = &self.inner;
        if inner.in_progress.get() {
            return Err(ConfigurationError::UnitInProgress(inner.id).into());
        }
        let scheduler = inner.scheduler();
        if let Some(scheduler) = &scheduler {
            if scheduler.is_locked() {
                return Err(StructuralError::Locked(scheduler.id()).into());
            }
        }

        let mut config = inner.config.borrow().clone();
        config.apply(patch);
        config.apply(&inner.kind.immutable);
        *inner.config.borrow_mut() = config.validated()?;

        if let Some(scheduler) = scheduler {
            scheduler.invalidate();
        }
        Ok(())
    }

    /// Get status flags
    pub fn status(&self) -> UnitStatus {
        let inner = &self.inner;
        UnitStatus {
            in_progress: inner.in_progress.get(),
            is_running: inner.is_running.get(),
            is_paused: inner.is_paused.get(),
            direction: inner.direction.get(),
            phase: inner.in_progress.get().then(|| inner.phase.get()),
        }
    }

    /// Get configured and derived timing
    pub fn timing(&self) -> UnitTiming {
        let config = self.inner.config.borrow();
        let rate = self.inner.compounded_playback_rate();
        let full_start_time = self.inner.full_start_time.get();
        let active_start_time = full_start_time + config.delay / rate;
        let active_finish_time = active_start_time + config.duration / rate;

        UnitTiming {
            duration: config.duration,
            delay: config.delay,
            end_delay: config.end_delay,
            playback_rate: config.playback_rate,
            starts_with_previous: config.starts_with_previous,
            starts_next_unit_too: config.starts_next_unit_too,
            compounded_playback_rate: rate,
            full_start_time,
            active_start_time,
            active_finish_time,
            full_finish_time: active_finish_time + config.end_delay / rate,
        }
    }

    /// Start of the delay phase on the owner's timeline
    pub fn full_start_time(&self) -> f64 {
        self.inner.full_start_time.get()
    }

    /// Start of the active phase on the owner's timeline
    pub fn active_start_time(&self) -> f64 {
        self.timing().active_start_time
    }

    /// End of the active phase on the owner's timeline
    pub fn active_finish_time(&self) -> f64 {
        self.timing().active_finish_time
    }

    /// End of the end-delay phase on the owner's timeline
    pub fn full_finish_time(&self) -> f64 {
        self.timing().full_finish_time
    }

    pub(crate) fn set_full_start_time(&self, time: f64) {
        self.inner.full_start_time.set(time);
    }

    pub(crate) fn adopt(&self, id: SchedulerId, scheduler: Weak<SchedulerInner>) {
        *self.inner.lineage.borrow_mut() = Some((id, scheduler));
    }

    pub(crate) fn orphan(&self) {
        *self.inner.lineage.borrow_mut() = None;
        self.inner.full_start_time.set(0.0);
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind.tag)
            .field("target", &self.inner.target)
            .field("status", &self.status())
            .finish()
    }
}

impl UnitInner {
    fn owner(&self) -> Option<SchedulerId> {
        self.lineage
            .borrow()
            .as_ref()
            .filter(|(_, scheduler)| scheduler.strong_count() > 0)
            .map(|(id, _)| *id)
    }

    fn scheduler(&self) -> Option<Rc<SchedulerInner>> {
        self.lineage
            .borrow()
            .as_ref()
            .and_then(|(_, scheduler)| scheduler.upgrade())
    }

    fn compounded_playback_rate(&self) -> f64 {
        let own = self.config.borrow().playback_rate;
        own * self
            .scheduler()
            .map_or(1.0, |scheduler| scheduler.compounded_playback_rate())
    }

    fn layout(&self, direction: Direction) -> PhaseLayout {
        let config = self.config.borrow();
        PhaseLayout::new(direction, config.delay, config.duration, config.end_delay)
    }

    fn start(self: &Rc<Self>, direction: Direction) -> PlaybackFuture {
        if self.in_progress.get() {
            return async { Ok(()) }.boxed_local();
        }
        self.begin(direction)
    }

    fn begin(self: &Rc<Self>, direction: Direction) -> PlaybackFuture {
        self.in_progress.set(true);
        self.is_running.set(true);
        self.is_paused.set(false);
        self.direction.set(direction);
        self.phase.set(Phase::Delay);
        self.passed.set(None);

        let timing = {
            let config = self.config.borrow();
            HostTiming {
                delay: config.delay,
                duration: config.duration,
                end_delay: config.end_delay,
                easing: config.easing.clone(),
                composite: config.composite,
            }
        };
        let rate = self.compounded_playback_rate();
        {
            let mut host = self.host.borrow_mut();
            host.set_timing(&timing);
            host.set_playback_rate(rate);
            host.set_direction(direction);
            if let Some(effect) = self.plan.eager(direction) {
                host.apply_effect(direction, effect);
            }
            host.play();
        }
        debug!(unit = %self.id, direction = ?direction, rate, "Traversal started");

        let inner = Rc::clone(self);
        async move { inner.drive(direction).await }.boxed_local()
    }

    fn finish(self: &Rc<Self>) -> PlaybackFuture {
        if self.is_paused.get() {
            return async { Ok(()) }.boxed_local();
        }
        if !self.in_progress.get() {
            let traversal = self.begin(self.direction.get());
            self.force_finish();
            return traversal;
        }

        let mut completed = self.completed.subscribe();
        self.force_finish();
        async move {
            // The sender lives as long as the unit; a closed channel means nothing is left to wait for
            let _ = completed.changed().await;
            Ok(())
        }
        .boxed_local()
    }

    /// Fast-forward every remaining stop. A paused unit fast-forwards once resumed.
    fn force_finish(&self) {
        debug!(unit = %self.id, "Finishing");
        self.using_finish.set(true);
        if self.is_running.get() && !self.held.get() {
            self.host.borrow_mut().finish();
        }
    }

    /// Pause if running. Returns whether anything changed.
    fn suspend(&self) -> bool {
        if !self.is_running.get() {
            return false;
        }
        self.is_running.set(false);
        self.is_paused.set(true);
        self.host.borrow_mut().pause();
        true
    }

    /// Resume if paused. Returns whether anything changed.
    fn resume(&self) -> bool {
        if !self.is_paused.get() {
            return false;
        }
        self.is_paused.set(false);
        self.is_running.set(true);
        if !self.held.get() {
            let mut host = self.host.borrow_mut();
            host.play();
            if self.using_finish.get() {
                host.finish();
            }
        }
        true
    }

    async fn drive(self: Rc<Self>, direction: Direction) -> Result<()> {
        match self.traverse(direction).await {
            Ok(()) => {
                self.complete(direction);
                Ok(())
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    async fn traverse(&self, direction: Direction) -> Result<()> {
        loop {
            let layout = self.layout(direction);
            let Some(stop) = self.next_stop(direction, &layout) else {
                return Ok(());
            };
            if self.reach(stop).await {
                self.arrive(direction, &layout, stop).await?;
            }
        }
    }

    fn next_stop(&self, direction: Direction, layout: &PhaseLayout) -> Option<f64> {
        let passed = self.passed.get();
        let marks = self.marks[direction.index()].borrow().positions(layout);
        Phase::ALL
            .iter()
            .map(|phase| layout.end_of(*phase))
            .chain(marks)
            .filter(|position| passed.map_or(true, |p| *position > p + EPSILON))
            .min_by(f64::total_cmp)
    }

    /// Run the host to `stop`. Returns `false` if marks changed on the way.
    async fn reach(&self, stop: f64) -> bool {
        let arrival = self.host.borrow_mut().run_to(stop);
        if self.using_finish.get() && self.is_running.get() {
            self.host.borrow_mut().finish();
        }
        tokio::select! {
            biased;
            _ = arrival => true,
            _ = self.marks_changed.notified() => false,
        }
    }

    async fn arrive(&self, direction: Direction, layout: &PhaseLayout, stop: f64) -> Result<()> {
        let passed = self.passed.get();
        trace!(unit = %self.id, direction = ?direction, position = stop, "Stop reached");

        let integrity = self.blockers_due(direction, layout, passed, stop, |marks| &marks.integrity);
        if !integrity.is_empty() {
            self.hold_for_integrity(integrity).await;
        }

        let roadblocks = self.blockers_due(direction, layout, passed, stop, |marks| &marks.roadblocks);
        if !roadblocks.is_empty() {
            self.hold_for_roadblocks(roadblocks).await;
        }

        for phase in Phase::ALL {
            let end = layout.end_of(phase);
            if within(passed, stop, end) {
                self.finish_phase(direction, phase, end)?;
            }
        }

        self.resolve_promises(direction, layout, stop);
        self.passed.set(Some(stop));
        Ok(())
    }

    fn blockers_due(
        &self,
        direction: Direction,
        layout: &PhaseLayout,
        passed: Option<f64>,
        stop: f64,
        select: impl Fn(&Marks) -> &Vec<(Mark, Blocker)>,
    ) -> Vec<Blocker> {
        let marks = self.marks[direction.index()].borrow();
        select(&marks)
            .iter()
            .filter(|(mark, _)| within(passed, stop, mark.resolve(layout)))
            .map(|(_, blocker)| blocker.clone())
            .collect()
    }

    /// Wait for earlier units without touching the pause state, so pause,
    /// unpause and finish still reach this unit while it waits.
    async fn hold_for_integrity(&self, blockers: Vec<Blocker>) {
        self.held.set(true);
        self.host.borrow_mut().pause();
        trace!(unit = %self.id, count = blockers.len(), "Waiting on integrity blocks");
        join_all(blockers.iter().map(Blocker::wait)).await;
        self.held.set(false);

        if self.is_running.get() {
            self.host.borrow_mut().play();
        }
    }

    async fn hold_for_roadblocks(&self, blockers: Vec<Blocker>) {
        match self.scheduler() {
            Some(root) => {
                root.hold();
                debug!(unit = %self.id, count = blockers.len(), "Roadblock reached, root held");
                join_all(blockers.iter().map(Blocker::wait)).await;
                debug!(unit = %self.id, "Roadblock cleared");
                root.release();
            }
            None => {
                let held = self.suspend();
                debug!(unit = %self.id, count = blockers.len(), "Roadblock reached, paused");
                join_all(blockers.iter().map(Blocker::wait)).await;
                debug!(unit = %self.id, "Roadblock cleared");
                if held {
                    self.resume();
                }
            }
        }
    }

    fn finish_phase(&self, direction: Direction, phase: Phase, position: f64) -> Result<()> {
        match phase {
            Phase::Delay => {
                self.fire_hooks(direction, phase, position)?;
                self.phase.set(Phase::Active);
                if let Some(effect) = self.plan.on_active_start(direction) {
                    self.host.borrow_mut().apply_effect(direction, effect);
                }
                if let Some(hook) = self.kind.on_start {
                    self.run_kind_hook(hook, direction, phase)?;
                }
            }
            Phase::Active => {
                self.finalize()?;
                if let Some(hook) = self.kind.on_finish {
                    self.run_kind_hook(hook, direction, phase)?;
                }
                self.fire_hooks(direction, phase, position)?;
                self.phase.set(Phase::EndDelay);
            }
            Phase::EndDelay => self.fire_hooks(direction, phase, position)?,
        }
        Ok(())
    }

    fn run_kind_hook(&self, hook: KindHook, direction: Direction, phase: Phase) -> std::result::Result<(), EffectError> {
        let mut host = self.host.borrow_mut();
        let mut context = HookContext {
            unit: self.id,
            direction,
            host: &mut **host,
        };
        hook(&mut context).map_err(|source| EffectError::Hook {
            unit: self.id,
            direction,
            phase,
            source,
        })
    }

    fn fire_hooks(&self, direction: Direction, phase: Phase, position: f64) -> std::result::Result<(), EffectError> {
        let cell = &self.marks[direction.index()];
        // Hooks may register more hooks or touch this unit
        let mut hooks = std::mem::take(&mut cell.borrow_mut().hooks);
        let event = PhaseEvent {
            unit: self.id,
            direction,
            phase,
            position,
        };
        let outcome = hooks
            .iter_mut()
            .filter(|(hook_phase, _)| *hook_phase == phase)
            .try_for_each(|(_, hook)| hook(&event));

        let mut marks = cell.borrow_mut();
        hooks.append(&mut marks.hooks);
        marks.hooks = hooks;

        outcome.map_err(|source| EffectError::Hook {
            unit: self.id,
            direction,
            phase,
            source,
        })
    }

    fn finalize(&self) -> std::result::Result<(), EffectError> {
        let (commits, forcefully) = {
            let config = self.config.borrow();
            (config.commits_final_state, config.commit_forcefully)
        };
        if !commits {
            return Ok(());
        }

        let mut host = self.host.borrow_mut();
        match host.commit_final_state(false) {
            Ok(()) => Ok(()),
            Err(source) if !forcefully => Err(EffectError::Finalization {
                unit: self.id,
                retried: false,
                source,
            }),
            Err(error) => {
                warn!(unit = %self.id, %error, "Committing end state failed, retrying forcefully");
                host.commit_final_state(true)
                    .map_err(|source| EffectError::Finalization {
                        unit: self.id,
                        retried: true,
                        source,
                    })
            }
        }
    }

    fn resolve_promises(&self, direction: Direction, layout: &PhaseLayout, stop: f64) {
        let due: Vec<oneshot::Sender<()>> = {
            let mut marks = self.marks[direction.index()].borrow_mut();
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut marks.promises)
                .into_iter()
                .partition(|(mark, _)| mark.resolve(layout) <= stop + EPSILON);
            marks.promises = pending;
            due.into_iter().map(|(_, sender)| sender).collect()
        };
        for sender in due {
            // The waiter may have given up
            let _ = sender.send(());
        }
    }

    fn reset(&self) {
        self.in_progress.set(false);
        self.is_running.set(false);
        self.is_paused.set(false);
        self.held.set(false);
        self.using_finish.set(false);
        self.passed.set(None);
        for marks in &self.marks {
            marks.borrow_mut().integrity.clear();
        }
    }

    fn complete(&self, direction: Direction) {
        self.host.borrow_mut().pause();
        self.reset();
        debug!(unit = %self.id, direction = ?direction, "Traversal completed");
        self.completed.send_modify(|count| *count += 1);
    }

    fn fail(&self, error: &SequencerError) {
        self.host.borrow_mut().cancel();
        self.reset();
        warn!(unit = %self.id, %error, "Traversal failed");
        self.completed.send_modify(|count| *count += 1);
    }
}
