// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy for units and schedulers.
//!
//! Structural, ownership and configuration errors are returned synchronously
//! from the call that caused them. Effect errors reject the playback future of
//! the unit that raised them. A roadblock that never resolves is not an error:
//! playback simply stays paused.

use crate::scheduler::SchedulerId;
use crate::timing::{Direction, Phase};
use crate::unit::UnitId;
use thiserror::Error;

/// Result type for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;

/// Mutating a scheduler's structure when it must not change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// The scheduler has started playing and has not been fully rewound
    #[error("Scheduler {0} is locked: it is in progress or was played without a full rewind")]
    Locked(SchedulerId),

    /// The unit already belongs to a scheduler
    #[error("Unit {unit} already belongs to scheduler {owner}")]
    AlreadyOwned {
        /// Unit being added
        unit: UnitId,
        /// Its current owner
        owner: SchedulerId,
    },

    /// The unit is not part of this scheduler
    #[error("Unit {unit} does not belong to scheduler {scheduler}")]
    NotMember {
        /// Unit being removed
        unit: UnitId,
        /// Scheduler it was removed from
        scheduler: SchedulerId,
    },
}

/// Driving an owned unit without its scheduler's authority
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OwnershipError {
    /// The call bypassed the owning scheduler
    #[error("Unit {unit} belongs to scheduler {owner}; drive it through its scheduler")]
    Bypassed {
        /// Unit that was called directly
        unit: UnitId,
        /// Its owner
        owner: SchedulerId,
    },
}

/// Invalid arguments to timing or configuration APIs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// Offset does not fit in the phase
    #[error("Offset {offset}ms is outside the {} phase (length {length}ms)", .phase.name())]
    OffsetOutOfRange {
        /// Phase addressed
        phase: Phase,
        /// Requested offset
        offset: f64,
        /// Phase length
        length: f64,
    },

    /// Percentage outside 0..=100
    #[error("Percentage {0} is outside 0..=100")]
    PercentOutOfRange(f64),

    /// Playback rate must be finite and positive
    #[error("Invalid playback rate: {0}")]
    InvalidPlaybackRate(f64),

    /// A timing field is negative or not finite
    #[error("Invalid {field}: {value}")]
    InvalidTiming {
        /// Field name
        field: &'static str,
        /// Rejected value
        value: f64,
    },

    /// Configuration cannot change while the unit is playing
    #[error("Unit {0} cannot be reconfigured while in progress")]
    UnitInProgress(UnitId),

    /// Manifest written by a newer format
    #[error("Manifest version {found} is newer than supported version {supported}")]
    UnsupportedManifestVersion {
        /// Version in the file
        found: u32,
        /// Highest version this build reads
        supported: u32,
    },

    /// Manifest could not be parsed or written
    #[error("Manifest error: {0}")]
    Manifest(String),
}

/// Failure reported by an effect host when persisting its end state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FinalizeError(pub String);

impl FinalizeError {
    /// Create a finalize error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure raised by a phase-boundary hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookFailure(pub String);

impl HookFailure {
    /// Create a hook failure
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that reject a unit's playback future
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// The host could not persist the effect's end state
    #[error("Unit {unit} could not finalize its end state (forceful retry: {retried}): {source}")]
    Finalization {
        /// Unit that failed
        unit: UnitId,
        /// Whether a forceful retry was attempted
        retried: bool,
        /// Host error
        source: FinalizeError,
    },

    /// A phase-boundary hook failed
    #[error("Hook for {} {} phase of unit {unit} failed: {source}", .direction.name(), .phase.name())]
    Hook {
        /// Unit whose hook failed
        unit: UnitId,
        /// Traversal direction
        direction: Direction,
        /// Phase that finished
        phase: Phase,
        /// Hook error
        source: HookFailure,
    },
}

/// Any sequencer error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SequencerError {
    /// Structural error
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Ownership error
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    /// Configuration error
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Effect error
    #[error(transparent)]
    Effect(#[from] EffectError),
}
