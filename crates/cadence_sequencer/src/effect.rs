// SPDX-License-Identifier: MIT OR Apache-2.0
//! Effect content handed to hosts.
//!
//! Exactly one way of producing effect content is chosen per unit. Static
//! variants are resolved once when the unit is built; generator variants are
//! resolved again every time the active phase starts.

use crate::keyframe::{reversed, sort_keyframes, Keyframe};
use crate::timing::Direction;
use std::fmt;
use std::rc::Rc;

/// Per-frame mutator, called with the direction progress (0..=1) of the active phase
pub type FrameMutator = Rc<dyn Fn(f64)>;

/// Produces keyframes for a traversal direction
pub type KeyframeFactory = Rc<dyn Fn(Direction) -> Vec<Keyframe>>;

/// Produces a mutator for a traversal direction
pub type MutatorFactory = Rc<dyn Fn(Direction) -> FrameMutator>;

/// How a unit produces its effect content
#[derive(Clone)]
pub enum EffectGenerator {
    /// Fixed keyframes. Missing backward keyframes mirror the forward ones.
    Keyframes {
        /// Keyframes sampled while playing forward
        forward: Vec<Keyframe>,
        /// Keyframes sampled while rewinding
        backward: Option<Vec<Keyframe>>,
    },
    /// Keyframes computed at every active-phase start
    KeyframeGenerator(KeyframeFactory),
    /// Fixed mutators. A missing backward mutator replays the forward one mirrored.
    FrameMutators {
        /// Mutator used while playing forward
        forward: FrameMutator,
        /// Mutator used while rewinding
        backward: Option<FrameMutator>,
    },
    /// Mutators computed at every active-phase start
    FrameMutatorGenerator(MutatorFactory),
}

impl EffectGenerator {
    /// Fixed forward keyframes, mirrored for rewinding
    pub fn keyframes(forward: Vec<Keyframe>) -> Self {
        Self::Keyframes { forward, backward: None }
    }

    /// A generator with no visible content
    pub fn empty() -> Self {
        Self::keyframes(Vec::new())
    }

    /// Fixed forward mutator, mirrored for rewinding
    pub fn mutator(forward: impl Fn(f64) + 'static) -> Self {
        Self::FrameMutators { forward: Rc::new(forward), backward: None }
    }
}

impl fmt::Debug for EffectGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyframes { forward, backward } => f
                .debug_struct("Keyframes")
                .field("forward", &forward.len())
                .field("backward", &backward.as_ref().map(Vec::len))
                .finish(),
            Self::KeyframeGenerator(_) => f.write_str("KeyframeGenerator"),
            Self::FrameMutators { backward, .. } => f
                .debug_struct("FrameMutators")
                .field("backward", &backward.is_some())
                .finish(),
            Self::FrameMutatorGenerator(_) => f.write_str("FrameMutatorGenerator"),
        }
    }
}

/// Effect content for one direction
#[derive(Clone)]
pub enum ResolvedEffect {
    /// Keyframes sorted by offset
    Keyframes(Rc<[Keyframe]>),
    /// Per-frame mutator
    Mutator(FrameMutator),
}

impl ResolvedEffect {
    fn from_keyframes(mut frames: Vec<Keyframe>) -> Self {
        sort_keyframes(&mut frames);
        Self::Keyframes(frames.into())
    }

    /// Keyframes, if this is keyframe content
    pub fn keyframes(&self) -> Option<&[Keyframe]> {
        match self {
            Self::Keyframes(frames) => Some(frames),
            Self::Mutator(_) => None,
        }
    }
}

impl fmt::Debug for ResolvedEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyframes(frames) => f.debug_tuple("Keyframes").field(&frames.len()).finish(),
            Self::Mutator(_) => f.write_str("Mutator"),
        }
    }
}

/// A generator plus whatever it resolved eagerly
pub(crate) struct EffectPlan {
    generator: EffectGenerator,
    resolved: Option<[ResolvedEffect; 2]>,
}

impl EffectPlan {
    pub(crate) fn new(generator: EffectGenerator) -> Self {
        let resolved = match &generator {
            EffectGenerator::Keyframes { forward, backward } => {
                let mut sorted = forward.clone();
                sort_keyframes(&mut sorted);
                let backward = backward.clone().unwrap_or_else(|| reversed(&sorted));
                Some([
                    ResolvedEffect::from_keyframes(sorted),
                    ResolvedEffect::from_keyframes(backward),
                ])
            }
            EffectGenerator::FrameMutators { forward, backward } => {
                let backward = backward.clone().unwrap_or_else(|| mirrored(forward.clone()));
                Some([
                    ResolvedEffect::Mutator(forward.clone()),
                    ResolvedEffect::Mutator(backward),
                ])
            }
            EffectGenerator::KeyframeGenerator(_) | EffectGenerator::FrameMutatorGenerator(_) => None,
        };
        Self { generator, resolved }
    }

    /// Content known before the traversal starts
    pub(crate) fn eager(&self, direction: Direction) -> Option<ResolvedEffect> {
        self.resolved
            .as_ref()
            .map(|pair| pair[direction.index()].clone())
    }

    /// Content produced at the start of the active phase
    pub(crate) fn on_active_start(&self, direction: Direction) -> Option<ResolvedEffect> {
        match &self.generator {
            EffectGenerator::KeyframeGenerator(factory) => {
                Some(ResolvedEffect::from_keyframes(factory(direction)))
            }
            EffectGenerator::FrameMutatorGenerator(factory) => {
                Some(ResolvedEffect::Mutator(factory(direction)))
            }
            EffectGenerator::Keyframes { .. } | EffectGenerator::FrameMutators { .. } => None,
        }
    }
}

fn mirrored(forward: FrameMutator) -> FrameMutator {
    Rc::new(move |progress| forward(1.0 - progress))
}
