// SPDX-License-Identifier: MIT OR Apache-2.0
//! Playback sequencer for Cadence.
//!
//! This crate groups independently-timed effects into synchronized playback
//! units and plays or rewinds them with reproducible timing:
//! - Units with delay / active / end-delay phases
//! - Roadblocks and time promises at any point of a phase
//! - Schedulers that derive start times from adjacency flags
//! - Integrity blocks that pin the completion order of parallel units
//!
//! ## Architecture
//!
//! Everything runs on a single logical thread. A [`Unit`] drives one
//! [`EffectHost`] through its phases; a [`Scheduler`] owns an ordered list of
//! units and polls the running ones concurrently. Nothing is spawned: playback
//! advances while the future returned by `play()` / `rewind()` is awaited.

pub mod blocker;
pub mod config;
pub mod effect;
pub mod error;
pub mod host;
pub mod keyframe;
pub mod kind;
pub mod scheduler;
pub mod timing;
pub mod unit;

pub use blocker::{Blocker, TimePromise};
pub use config::{
    Composite, SchedulerConfig, SequenceManifest, UnitConfig, UnitConfigPatch, UnitSpec,
    MANIFEST_FORMAT_VERSION,
};
pub use effect::{EffectGenerator, FrameMutator, ResolvedEffect};
pub use error::{
    ConfigurationError, EffectError, FinalizeError, HookFailure, OwnershipError, Result,
    SequencerError, StructuralError,
};
pub use host::{ClockHost, ClockProbe, EffectHost, HostProgress, HostTiming};
pub use keyframe::{Interpolation, InterpolationMode, Keyframe, KeyframeValue};
pub use kind::{EffectKind, HookContext, KindTag};
pub use scheduler::{Scheduler, SchedulerId, SchedulerStatus, SchedulerTiming};
pub use timing::{Direction, Phase, PhaseLayout, Position, MIN_DURATION};
pub use unit::{
    PhaseEvent, PhaseHook, PlaybackFuture, Unit, UnitBuilder, UnitId, UnitStatus, UnitTiming,
};
