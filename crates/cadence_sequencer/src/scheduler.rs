// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scheduler: an ordered sequence of units played and rewound in parallel.
//!
//! `commit` derives every unit's start time from the adjacency flags and
//! builds four groupings. During playback, integrity blocks installed from
//! the completion-order groupings make units finish their phases in the
//! order those start times imply, whatever the hosts report.

use crate::blocker::Blocker;
use crate::config::SchedulerConfig;
use crate::error::{ConfigurationError, Result, SequencerError, StructuralError};
use crate::timing::{Direction, Phase, Position, EPSILON};
use crate::unit::{PlaybackFuture, Unit, UnitId, UnitTiming};
use futures::future::Future;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerId(u64);

impl SchedulerId {
    fn next() -> Self {
        Self(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw counter value
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Status flags of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStatus {
    /// In progress and paused
    pub is_paused: bool,
    /// In progress and not paused
    pub is_running: bool,
    /// Playing or rewinding
    pub in_progress: bool,
    /// The last play or rewind ran to completion
    pub is_finished: bool,
    /// Last completed playback was forward
    pub was_played: bool,
    /// Last completed playback was backward
    pub was_rewound: bool,
    /// Units are being fast-forwarded
    pub using_finish: bool,
    /// Units cannot be added or removed
    pub locked_structure: bool,
}

/// Timing of a scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerTiming {
    /// Playback rate compounded into every unit
    pub playback_rate: f64,
    /// Latest full finish time of any unit
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    is_paused: bool,
    is_running: bool,
    in_progress: bool,
    is_finished: bool,
    was_played: bool,
    was_rewound: bool,
    using_finish: bool,
}

#[derive(Default)]
struct Groupings {
    forward: Vec<Vec<Unit>>,
    active_finish: Vec<Vec<Unit>>,
    end_delay_finish: Vec<Vec<Unit>>,
    backward_active_finish: Vec<Vec<Unit>>,
}

/// A unit and its timing at commit
struct Entry {
    index: usize,
    unit: Unit,
    timing: UnitTiming,
}

fn units_of(entries: &[&Entry]) -> Vec<Unit> {
    entries.iter().map(|entry| entry.unit.clone()).collect()
}

fn ids_of(groups: &[Vec<Unit>]) -> Vec<Vec<UnitId>> {
    groups
        .iter()
        .map(|group| group.iter().map(Unit::id).collect())
        .collect()
}

pub(crate) struct SchedulerInner {
    id: SchedulerId,
    config: RefCell<SchedulerConfig>,
    units: RefCell<Vec<Unit>>,
    groupings: RefCell<Groupings>,
    committed: Cell<bool>,
    flags: Cell<Flags>,
    running: RefCell<IndexMap<UnitId, Unit>>,
    /// Roadblocks currently holding the scheduler
    holds: Cell<usize>,
    /// Whether the scheduler resumes once the last hold is released
    resume_on_release: Cell<bool>,
    failure: RefCell<Option<SequencerError>>,
    finished: watch::Sender<u64>,
}

/// Handle to a scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new(config: SchedulerConfig) -> std::result::Result<Self, ConfigurationError> {
        Ok(Self::with_config(config.validated()?))
    }

    fn with_config(config: SchedulerConfig) -> Self {
        let id = SchedulerId::next();
        debug!(scheduler = %id, description = %config.description, "Scheduler created");
        let (finished, _) = watch::channel(0);
        Self {
            inner: Rc::new(SchedulerInner {
                id,
                config: RefCell::new(config),
                units: RefCell::new(Vec::new()),
                groupings: RefCell::new(Groupings::default()),
                committed: Cell::new(false),
                flags: Cell::new(Flags::default()),
                running: RefCell::new(IndexMap::new()),
                holds: Cell::new(0),
                resume_on_release: Cell::new(false),
                failure: RefCell::new(None),
                finished,
            }),
        }
    }

    /// Get the scheduler's id
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    /// Get the configuration
    pub fn config(&self) -> SchedulerConfig {
        self.inner.config.borrow().clone()
    }

    /// Append units. They must not belong to any scheduler.
    pub fn add_units(&self, units: impl IntoIterator<Item = Unit>) -> std::result::Result<(), StructuralError> {
        let inner = &self.inner;
        if inner.is_locked() {
            return Err(StructuralError::Locked(inner.id));
        }

        let units: Vec<Unit> = units.into_iter().collect();
        for (index, unit) in units.iter().enumerate() {
            if let Some(owner) = unit.parent() {
                return Err(StructuralError::AlreadyOwned { unit: unit.id(), owner });
            }
            if units[..index].iter().any(|other| other.id() == unit.id()) {
                return Err(StructuralError::AlreadyOwned {
                    unit: unit.id(),
                    owner: inner.id,
                });
            }
        }

        for unit in &units {
            unit.adopt(inner.id, Rc::downgrade(inner));
        }
        debug!(scheduler = %inner.id, count = units.len(), "Units added");
        inner.units.borrow_mut().extend(units);
        inner.invalidate();
        Ok(())
    }

    /// Remove units and release them from this scheduler
    pub fn remove_units(&self, ids: &[UnitId]) -> std::result::Result<Vec<Unit>, StructuralError> {
        let inner = &self.inner;
        if inner.is_locked() {
            return Err(StructuralError::Locked(inner.id));
        }

        let mut units = inner.units.borrow_mut();
        if let Some(missing) = ids.iter().find(|id| !units.iter().any(|unit| unit.id() == **id)) {
            return Err(StructuralError::NotMember {
                unit: *missing,
                scheduler: inner.id,
            });
        }

        let (removed, kept): (Vec<Unit>, Vec<Unit>) = units.drain(..).partition(|unit| ids.contains(&unit.id()));
        *units = kept;
        drop(units);

        for unit in &removed {
            unit.orphan();
        }
        debug!(scheduler = %inner.id, count = removed.len(), "Units removed");
        inner.invalidate();
        Ok(removed)
    }

    /// Units in playback order
    pub fn units(&self) -> Vec<Unit> {
        self.inner.units.borrow().clone()
    }

    /// Find a unit by id
    pub fn unit(&self, id: UnitId) -> Option<Unit> {
        self.inner.units.borrow().iter().find(|unit| unit.id() == id).cloned()
    }

    /// Recompute start times and groupings. Ignored while in progress.
    pub fn commit(&self) {
        if self.inner.flags.get().in_progress {
            warn!(scheduler = %self.inner.id, "Commit ignored while in progress");
            return;
        }
        self.inner.commit();
    }

    /// Units sharing a start time, in commit order
    pub fn forward_groupings(&self) -> Vec<Vec<UnitId>> {
        self.inner.commit_if_needed();
        ids_of(&self.inner.groupings.borrow().forward)
    }

    /// Per group, units ordered by active finish time
    pub fn active_finish_groupings(&self) -> Vec<Vec<UnitId>> {
        self.inner.commit_if_needed();
        ids_of(&self.inner.groupings.borrow().active_finish)
    }

    /// Per group, units ordered by full finish time
    pub fn end_delay_finish_groupings(&self) -> Vec<Vec<UnitId>> {
        self.inner.commit_if_needed();
        ids_of(&self.inner.groupings.borrow().end_delay_finish)
    }

    /// Per group, the order in which units finish their backward active phase
    pub fn backward_active_finish_groupings(&self) -> Vec<Vec<UnitId>> {
        self.inner.commit_if_needed();
        ids_of(&self.inner.groupings.borrow().backward_active_finish)
    }

    /// Play every unit forward. A no-op if already in progress.
    pub fn play(&self) -> Result<PlaybackFuture> {
        self.inner.start(Direction::Forward)
    }

    /// Rewind every unit. A no-op if already in progress.
    pub fn rewind(&self) -> Result<PlaybackFuture> {
        self.inner.start(Direction::Backward)
    }

    /// Pause the running units.
    ///
    /// While a roadblock holds the scheduler, this keeps it paused after the
    /// roadblock clears.
    pub fn pause(&self) {
        let inner = &self.inner;
        if inner.holds.get() > 0 {
            inner.resume_on_release.set(false);
        }
        inner.pause_all();
    }

    /// Resume the paused units.
    ///
    /// While a roadblock holds the scheduler, resuming is deferred until the
    /// last roadblock clears.
    pub fn unpause(&self) {
        let inner = &self.inner;
        if inner.holds.get() > 0 {
            if inner.flags.get().is_paused {
                inner.resume_on_release.set(true);
            }
            return;
        }
        inner.resume_all();
    }

    /// Fast-forward to the end. A no-op while paused.
    ///
    /// If not in progress this starts a fast-forwarded `play()` and returns
    /// its future. Otherwise every running unit is finished and the future
    /// resolves once the ongoing playback completes or fails; that playback's
    /// own future must still be polled.
    pub fn finish(&self) -> Result<PlaybackFuture> {
        let inner = &self.inner;
        let flags = inner.flags.get();
        if flags.is_paused {
            return Ok(async { Ok(()) }.boxed_local());
        }
        inner.update(|flags| flags.using_finish = true);
        info!(scheduler = %inner.id, "Finishing");

        if !flags.in_progress {
            return inner.start(Direction::Forward);
        }

        let mut finished = inner.finished.subscribe();
        for unit in inner.running_units() {
            unit.finish_owned(inner.id)?;
        }
        let inner = Rc::clone(inner);
        Ok(async move {
            let _ = finished.changed().await;
            let failure = inner.failure.borrow().clone();
            failure.map_or(Ok(()), Err)
        }
        .boxed_local())
    }

    /// Change the playback rate compounded into every unit
    pub fn set_playback_rate(&self, rate: f64) -> Result<()> {
        let inner = &self.inner;
        if inner.flags.get().in_progress {
            return Err(StructuralError::Locked(inner.id).into());
        }
        let config = inner.config.borrow().clone().with_playback_rate(rate).validated()?;
        *inner.config.borrow_mut() = config;
        inner.invalidate();
        Ok(())
    }

    /// Get status flags
    pub fn status(&self) -> SchedulerStatus {
        let flags = self.inner.flags.get();
        SchedulerStatus {
            is_paused: flags.is_paused,
            is_running: flags.is_running,
            in_progress: flags.in_progress,
            is_finished: flags.is_finished,
            was_played: flags.was_played,
            was_rewound: flags.was_rewound,
            using_finish: flags.using_finish,
            locked_structure: self.inner.is_locked(),
        }
    }

    /// Get timing
    pub fn timing(&self) -> SchedulerTiming {
        self.inner.commit_if_needed();
        let duration = self
            .inner
            .units
            .borrow()
            .iter()
            .map(Unit::full_finish_time)
            .fold(0.0, f64::max);
        SchedulerTiming {
            playback_rate: self.inner.compounded_playback_rate(),
            duration,
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("description", &self.inner.config.borrow().description)
            .field("units", &self.inner.units.borrow().len())
            .field("status", &self.status())
            .finish()
    }
}

impl SchedulerInner {
    pub(crate) fn id(&self) -> SchedulerId {
        self.id
    }

    pub(crate) fn compounded_playback_rate(&self) -> f64 {
        self.config.borrow().playback_rate
    }

    pub(crate) fn is_locked(&self) -> bool {
        let flags = self.flags.get();
        flags.in_progress || flags.was_played
    }

    pub(crate) fn invalidate(&self) {
        self.committed.set(false);
    }

    /// Pause for a roadblock. Holds nest; only the first one pauses.
    pub(crate) fn hold(&self) {
        let holds = self.holds.get();
        self.holds.set(holds + 1);
        if holds == 0 {
            self.resume_on_release.set(self.pause_all());
        }
    }

    /// Release one [`hold`](Self::hold). The last release resumes what the first hold paused.
    pub(crate) fn release(&self) {
        let holds = self.holds.get().saturating_sub(1);
        self.holds.set(holds);
        if holds == 0 && self.resume_on_release.replace(false) {
            self.resume_all();
        }
    }

    fn update(&self, change: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.get();
        change(&mut flags);
        self.flags.set(flags);
    }

    fn running_units(&self) -> Vec<Unit> {
        self.running.borrow().values().cloned().collect()
    }

    fn pause_all(&self) -> bool {
        if !self.flags.get().is_running {
            return false;
        }
        self.update(|flags| {
            flags.is_running = false;
            flags.is_paused = true;
        });
        for unit in self.running_units() {
            if let Err(error) = unit.pause_owned(self.id) {
                warn!(scheduler = %self.id, unit = %unit.id(), %error, "Could not pause unit");
            }
        }
        info!(scheduler = %self.id, "Paused");
        true
    }

    fn resume_all(&self) {
        if !self.flags.get().is_paused {
            return;
        }
        self.update(|flags| {
            flags.is_paused = false;
            flags.is_running = true;
        });
        for unit in self.running_units() {
            if let Err(error) = unit.unpause_owned(self.id) {
                warn!(scheduler = %self.id, unit = %unit.id(), %error, "Could not unpause unit");
            }
        }
        info!(scheduler = %self.id, "Unpaused");
    }

    fn commit_if_needed(&self) {
        if !self.committed.get() && !self.flags.get().in_progress {
            self.commit();
        }
    }

    fn commit(&self) {
        let units = self.units.borrow();
        let mut groups: Vec<Vec<Entry>> = Vec::new();
        let mut barrier = 0.0_f64;
        let mut anchor = 0.0;

        for (index, unit) in units.iter().enumerate() {
            let joins = index > 0 && {
                let config = unit.config();
                config.starts_with_previous || units[index - 1].config().starts_next_unit_too
            };
            if !joins {
                anchor = barrier;
                groups.push(Vec::new());
            }
            unit.set_full_start_time(anchor);
            let timing = unit.timing();
            barrier = barrier.max(timing.full_finish_time);
            if let Some(group) = groups.last_mut() {
                group.push(Entry {
                    index,
                    unit: unit.clone(),
                    timing,
                });
            }
        }

        let mut groupings = Groupings::default();
        for group in &groups {
            let mut active: Vec<&Entry> = group.iter().collect();
            active.sort_by(|a, b| {
                a.timing
                    .active_finish_time
                    .total_cmp(&b.timing.active_finish_time)
                    .then(a.index.cmp(&b.index))
            });

            let mut end_delay: Vec<&Entry> = group.iter().collect();
            end_delay.sort_by(|a, b| {
                a.timing
                    .full_finish_time
                    .total_cmp(&b.timing.full_finish_time)
                    .then(a.index.cmp(&b.index))
            });

            // Rewinding retraces forward playback: latest active start first.
            // Ties go to the later full finish, then to the later unit.
            let mut backward: Vec<&Entry> = group.iter().collect();
            backward.sort_by(|a, b| {
                b.timing
                    .active_start_time
                    .total_cmp(&a.timing.active_start_time)
                    .then(b.timing.full_finish_time.total_cmp(&a.timing.full_finish_time))
                    .then(b.index.cmp(&a.index))
            });

            groupings.forward.push(group.iter().map(|entry| entry.unit.clone()).collect());
            groupings.active_finish.push(units_of(&active));
            groupings.end_delay_finish.push(units_of(&end_delay));
            groupings.backward_active_finish.push(units_of(&backward));
        }

        debug!(
            scheduler = %self.id,
            units = units.len(),
            groups = groupings.forward.len(),
            duration = barrier,
            "Committed"
        );
        *self.groupings.borrow_mut() = groupings;
        self.committed.set(true);
    }

    fn start(self: &Rc<Self>, direction: Direction) -> Result<PlaybackFuture> {
        if self.flags.get().in_progress {
            return Ok(async { Ok(()) }.boxed_local());
        }
        self.commit_if_needed();
        self.install_integrity_blocks(direction)?;
        self.holds.set(0);
        self.resume_on_release.set(false);
        self.failure.borrow_mut().take();
        self.update(|flags| {
            flags.in_progress = true;
            flags.is_running = true;
            flags.is_paused = false;
            flags.is_finished = false;
        });
        info!(scheduler = %self.id, direction = ?direction, "Playback started");

        let inner = Rc::clone(self);
        Ok(async move { inner.run(direction).await }.boxed_local())
    }

    fn install_integrity_blocks(&self, direction: Direction) -> Result<()> {
        let groupings = self.groupings.borrow();
        match direction {
            Direction::Forward => {
                for group in &groupings.active_finish {
                    chain_integrity(group, direction, Phase::Active)?;
                }
                for group in &groupings.end_delay_finish {
                    chain_integrity(group, direction, Phase::EndDelay)?;
                }
            }
            Direction::Backward => {
                for group in &groupings.backward_active_finish {
                    chain_integrity(group, direction, Phase::Active)?;
                }
            }
        }
        Ok(())
    }

    async fn run(self: Rc<Self>, direction: Direction) -> Result<()> {
        let outcome = match direction {
            Direction::Forward => self.run_forward().await,
            Direction::Backward => self.run_backward().await,
        };
        match outcome {
            Ok(()) => {
                self.complete(direction);
                Ok(())
            }
            Err(error) => {
                self.halt(&error);
                Err(error)
            }
        }
    }

    async fn run_forward(self: &Rc<Self>) -> Result<()> {
        let groups = self.groupings.borrow().forward.clone();
        for group in &groups {
            let mut running = FuturesUnordered::new();
            for (index, unit) in group.iter().enumerate() {
                if index > 0 {
                    // Staggered start: wait for the previous unit's active phase to begin
                    let previous = &group[index - 1];
                    let begins = previous.generate_time_promise(Direction::Forward, Phase::Active, Position::Beginning)?;
                    drive_until(&mut running, begins).await?;
                }
                running.push(self.start_unit(unit, Direction::Forward)?);
            }
            drain(&mut running).await?;
        }
        Ok(())
    }

    async fn run_backward(self: &Rc<Self>) -> Result<()> {
        let groups = self.groupings.borrow().end_delay_finish.clone();
        for group in groups.iter().rev() {
            let Some(last) = group.last() else {
                continue;
            };
            let mut running = FuturesUnordered::new();
            running.push(self.start_unit(last, Direction::Backward)?);

            for pair in group.windows(2).rev() {
                let (current, next) = (&pair[0], &pair[1]);
                let finish = current.full_finish_time();
                // Start where the forward intervals intersected, or once `next`
                // has rewound through its own delay
                let reached = if finish > next.full_start_time() + EPSILON {
                    let (phase, position) = next.backward_point_at(finish);
                    next.generate_time_promise(Direction::Backward, phase, position)?
                } else {
                    next.generate_time_promise(Direction::Backward, Phase::Delay, Position::End)?
                };
                drive_until(&mut running, reached).await?;
                running.push(self.start_unit(current, Direction::Backward)?);
            }
            drain(&mut running).await?;
        }
        Ok(())
    }

    fn start_unit(self: &Rc<Self>, unit: &Unit, direction: Direction) -> Result<PlaybackFuture> {
        let traversal = match direction {
            Direction::Forward => unit.play_owned(self.id)?,
            Direction::Backward => unit.rewind_owned(self.id)?,
        };
        let id = unit.id();
        self.running.borrow_mut().insert(id, unit.clone());

        let flags = self.flags.get();
        if flags.using_finish {
            unit.finish_owned(self.id)?;
        }
        if flags.is_paused {
            unit.pause_owned(self.id)?;
        }

        let inner = Rc::clone(self);
        Ok(async move {
            let result = traversal.await;
            inner.running.borrow_mut().shift_remove(&id);
            result
        }
        .boxed_local())
    }

    fn complete(&self, direction: Direction) {
        self.update(|flags| {
            flags.in_progress = false;
            flags.is_running = false;
            flags.is_paused = false;
            flags.using_finish = false;
            flags.is_finished = true;
            flags.was_played = direction == Direction::Forward;
            flags.was_rewound = direction == Direction::Backward;
        });
        info!(scheduler = %self.id, direction = ?direction, "Playback completed");
        self.finished.send_modify(|count| *count += 1);
    }

    /// Stop everything after a unit failed. The scheduler stays in progress and paused.
    fn halt(&self, error: &SequencerError) {
        tracing::error!(scheduler = %self.id, %error, "Unit failed, pausing");
        if !self.pause_all() {
            self.update(|flags| {
                flags.is_running = false;
                flags.is_paused = true;
            });
        }
        *self.failure.borrow_mut() = Some(error.clone());
        self.finished.send_modify(|count| *count += 1);
    }
}

/// Make each unit of an ordered group reach the end of `phase` only after its predecessor
fn chain_integrity(group: &[Unit], direction: Direction, phase: Phase) -> Result<()> {
    for pair in group.windows(2) {
        let reached = pair[0].generate_time_promise(direction, phase, Position::End)?;
        pair[1].add_integrity_blocks(direction, phase, Position::End, [Blocker::from(reached)])?;
    }
    Ok(())
}

/// Poll running units until `until` resolves
async fn drive_until(
    running: &mut FuturesUnordered<PlaybackFuture>,
    until: impl Future<Output = ()>,
) -> Result<()> {
    futures::pin_mut!(until);
    loop {
        tokio::select! {
            biased;
            () = &mut until => return Ok(()),
            Some(result) = running.next() => result?,
        }
    }
}

async fn drain(running: &mut FuturesUnordered<PlaybackFuture>) -> Result<()> {
    while let Some(result) = running.next().await {
        result?;
    }
    Ok(())
}
