// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directions, phases and positions on a unit's local timeline.
//!
//! A traversal always runs delay -> active -> end-delay in its own direction.
//! Rewinding therefore starts with the forward end delay: the backward
//! "delay" phase covers the forward end-delay region and vice versa. Positions
//! are measured in local milliseconds from the start of the traversal.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Smallest duration a unit may have (milliseconds)
pub const MIN_DURATION: f64 = 0.01;

/// Tolerance used when comparing timeline positions
pub(crate) const EPSILON: f64 = 1e-6;

/// Playback direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Playing forward
    #[default]
    Forward,
    /// Rewinding
    Backward,
}

impl Direction {
    /// The opposite direction
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    /// Get the display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Backward => 1,
        }
    }
}

/// Phase of a traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting before the effect runs
    Delay,
    /// The effect itself
    Active,
    /// Holding after the effect ran
    EndDelay,
}

impl Phase {
    /// All phases in traversal order
    pub const ALL: [Phase; 3] = [Phase::Delay, Phase::Active, Phase::EndDelay];

    /// Get the display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Active => "active",
            Self::EndDelay => "end-delay",
        }
    }
}

/// A point within a phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Position {
    /// First instant of the phase
    Beginning,
    /// Last instant of the phase
    End,
    /// Milliseconds from the beginning of the phase
    Offset(f64),
    /// Percentage (0..=100) of the phase's length
    Percent(f64),
}

/// Phase geometry of one traversal, in local milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseLayout {
    /// Length of the delay phase in this direction
    pub delay: f64,
    /// Length of the active phase
    pub active: f64,
    /// Length of the end-delay phase in this direction
    pub end_delay: f64,
}

impl PhaseLayout {
    /// Build the layout for a direction from forward timing values
    pub fn new(direction: Direction, delay: f64, duration: f64, end_delay: f64) -> Self {
        match direction {
            Direction::Forward => Self { delay, active: duration, end_delay },
            Direction::Backward => Self { delay: end_delay, active: duration, end_delay: delay },
        }
    }

    /// Length of a phase
    pub fn length(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Delay => self.delay,
            Phase::Active => self.active,
            Phase::EndDelay => self.end_delay,
        }
    }

    /// Position where a phase begins
    pub fn start_of(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Delay => 0.0,
            Phase::Active => self.delay,
            Phase::EndDelay => self.delay + self.active,
        }
    }

    /// Position where a phase ends
    pub fn end_of(&self, phase: Phase) -> f64 {
        self.start_of(phase) + self.length(phase)
    }

    /// Resolve a position within a phase to a traversal position
    pub fn resolve(&self, phase: Phase, position: Position) -> Result<f64, ConfigurationError> {
        let length = self.length(phase);
        let offset = match position {
            Position::Beginning => 0.0,
            Position::End => length,
            Position::Offset(offset) => {
                if !offset.is_finite() || offset < 0.0 || offset > length + EPSILON {
                    return Err(ConfigurationError::OffsetOutOfRange { phase, offset, length });
                }
                offset.min(length)
            }
            Position::Percent(percent) => {
                if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
                    return Err(ConfigurationError::PercentOutOfRange(percent));
                }
                length * percent / 100.0
            }
        };
        Ok(self.start_of(phase) + offset)
    }

    /// Resolve a position that was valid when registered, clamping offsets
    /// that no longer fit after the timing changed.
    pub(crate) fn resolve_clamped(&self, phase: Phase, position: Position) -> f64 {
        let position = match position {
            Position::Offset(offset) => Position::Offset(offset.clamp(0.0, self.length(phase))),
            other => other,
        };
        self.resolve(phase, position)
            .unwrap_or_else(|_| self.end_of(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_layout() {
        let layout = PhaseLayout::new(Direction::Forward, 100.0, 300.0, 50.0);
        assert_eq!(layout.end_of(Phase::Delay), 100.0);
        assert_eq!(layout.end_of(Phase::Active), 400.0);
        assert_eq!(layout.end_of(Phase::EndDelay), 450.0);
    }

    #[test]
    fn test_backward_layout_swaps_delays() {
        let layout = PhaseLayout::new(Direction::Backward, 100.0, 300.0, 50.0);
        assert_eq!(layout.length(Phase::Delay), 50.0);
        assert_eq!(layout.length(Phase::EndDelay), 100.0);
        assert_eq!(layout.start_of(Phase::Active), 50.0);
    }

    #[test]
    fn test_resolve_positions() {
        let layout = PhaseLayout::new(Direction::Forward, 100.0, 200.0, 0.0);
        assert_eq!(layout.resolve(Phase::Active, Position::Beginning).unwrap(), 100.0);
        assert_eq!(layout.resolve(Phase::Active, Position::End).unwrap(), 300.0);
        assert_eq!(layout.resolve(Phase::Active, Position::Offset(50.0)).unwrap(), 150.0);
        assert_eq!(layout.resolve(Phase::Active, Position::Percent(25.0)).unwrap(), 150.0);
        assert_eq!(layout.resolve(Phase::EndDelay, Position::End).unwrap(), 300.0);
    }

    #[test]
    fn test_resolve_rejects_invalid_positions() {
        let layout = PhaseLayout::new(Direction::Forward, 0.0, 200.0, 0.0);
        assert!(matches!(
            layout.resolve(Phase::Active, Position::Offset(250.0)),
            Err(ConfigurationError::OffsetOutOfRange { .. })
        ));
        assert!(matches!(
            layout.resolve(Phase::Active, Position::Offset(-1.0)),
            Err(ConfigurationError::OffsetOutOfRange { .. })
        ));
        assert!(matches!(
            layout.resolve(Phase::Delay, Position::Percent(120.0)),
            Err(ConfigurationError::PercentOutOfRange(_))
        ));
    }

    #[test]
    fn test_resolve_clamped_after_shrink() {
        let layout = PhaseLayout::new(Direction::Forward, 0.0, 100.0, 0.0);
        assert_eq!(layout.resolve_clamped(Phase::Active, Position::Offset(400.0)), 100.0);
    }
}
