// SPDX-License-Identifier: MIT OR Apache-2.0
//! Effect kinds.
//!
//! A kind is a plain record selected by [`KindTag`]: default configuration,
//! configuration that callers cannot override, and hooks run when the active
//! phase starts and finishes.

use crate::config::{Composite, UnitConfigPatch};
use crate::error::HookFailure;
use crate::host::EffectHost;
use crate::timing::Direction;
use crate::unit::UnitId;
use serde::{Deserialize, Serialize};

/// Kind of effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindTag {
    /// Brings a target into view
    Entrance,
    /// Takes a target out of view
    Exit,
    /// Draws attention to a visible target
    Emphasis,
    /// Moves a target
    Motion,
    /// Changes a target from one state to another
    Transition,
}

impl KindTag {
    /// Get the display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Entrance => "Entrance",
            Self::Exit => "Exit",
            Self::Emphasis => "Emphasis",
            Self::Motion => "Motion",
            Self::Transition => "Transition",
        }
    }

    /// Get all kinds
    pub fn all() -> &'static [KindTag] {
        &[
            KindTag::Entrance,
            KindTag::Exit,
            KindTag::Emphasis,
            KindTag::Motion,
            KindTag::Transition,
        ]
    }

    /// Build the descriptor for this kind
    pub fn descriptor(self) -> EffectKind {
        match self {
            Self::Entrance => EffectKind {
                tag: self,
                defaults: UnitConfigPatch::new(),
                immutable: UnitConfigPatch::new(),
                on_start: Some(reveal_when_entering),
                on_finish: Some(conceal_when_rewound),
            },
            Self::Exit => EffectKind {
                tag: self,
                defaults: UnitConfigPatch::new(),
                immutable: UnitConfigPatch::new(),
                on_start: Some(reveal_when_rewinding),
                on_finish: Some(conceal_when_exited),
            },
            Self::Emphasis => EffectKind {
                tag: self,
                defaults: UnitConfigPatch::new(),
                immutable: UnitConfigPatch::new(),
                on_start: None,
                on_finish: None,
            },
            Self::Motion => EffectKind {
                tag: self,
                defaults: UnitConfigPatch {
                    composite: Some(Composite::Accumulate),
                    ..UnitConfigPatch::new()
                },
                immutable: UnitConfigPatch {
                    commits_final_state: Some(true),
                    ..UnitConfigPatch::new()
                },
                on_start: None,
                on_finish: None,
            },
            Self::Transition => EffectKind {
                tag: self,
                defaults: UnitConfigPatch::new(),
                immutable: UnitConfigPatch {
                    commits_final_state: Some(true),
                    ..UnitConfigPatch::new()
                },
                on_start: None,
                on_finish: None,
            },
        }
    }
}

/// What a kind hook can see and touch
pub struct HookContext<'a> {
    /// Unit running the hook
    pub unit: UnitId,
    /// Traversal direction
    pub direction: Direction,
    /// The unit's host
    pub host: &'a mut dyn EffectHost,
}

/// Kind-level hook
pub type KindHook = fn(&mut HookContext<'_>) -> Result<(), HookFailure>;

/// Descriptor of an effect kind
#[derive(Debug, Clone)]
pub struct EffectKind {
    /// Tag selecting this descriptor
    pub tag: KindTag,
    /// Defaults applied before caller overrides
    pub defaults: UnitConfigPatch,
    /// Settings applied after caller overrides
    pub immutable: UnitConfigPatch,
    /// Runs when the active phase starts
    pub on_start: Option<KindHook>,
    /// Runs when the active phase finishes
    pub on_finish: Option<KindHook>,
}

fn reveal_when_entering(ctx: &mut HookContext<'_>) -> Result<(), HookFailure> {
    if ctx.direction == Direction::Forward {
        ctx.host.set_presence(true);
    }
    Ok(())
}

fn conceal_when_rewound(ctx: &mut HookContext<'_>) -> Result<(), HookFailure> {
    if ctx.direction == Direction::Backward {
        ctx.host.set_presence(false);
    }
    Ok(())
}

fn reveal_when_rewinding(ctx: &mut HookContext<'_>) -> Result<(), HookFailure> {
    if ctx.direction == Direction::Backward {
        ctx.host.set_presence(true);
    }
    Ok(())
}

fn conceal_when_exited(ctx: &mut HookContext<'_>) -> Result<(), HookFailure> {
    if ctx.direction == Direction::Forward {
        ctx.host.set_presence(false);
    }
    Ok(())
}
