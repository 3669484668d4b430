// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unit and scheduler configuration, and the RON sequence manifest.
//!
//! Unit configuration is layered: crate defaults, then the kind's defaults,
//! then caller overrides, then the kind's immutable settings.

use crate::error::ConfigurationError;
use crate::keyframe::Keyframe;
use crate::kind::KindTag;
use crate::timing::MIN_DURATION;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current sequence manifest format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// How an effect combines with the target's underlying value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Composite {
    /// Replace the underlying value
    #[default]
    Replace,
    /// Add to the underlying value
    Add,
    /// Accumulate onto the underlying value
    Accumulate,
}

/// Timing and behavior of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Length of the active phase (ms)
    pub duration: f64,
    /// Length of the delay phase (ms)
    pub delay: f64,
    /// Length of the end-delay phase (ms)
    pub end_delay: f64,
    /// Base playback rate
    pub playback_rate: f64,
    /// Easing name, interpreted by the host
    pub easing: String,
    /// Composite operation, interpreted by the host
    pub composite: Composite,
    /// Start together with the previous unit
    pub starts_with_previous: bool,
    /// Make the next unit start together with this one
    pub starts_next_unit_too: bool,
    /// Ask the host to persist the end state when the active phase finishes
    pub commits_final_state: bool,
    /// Retry a failed persist once in forceful mode
    pub commit_forcefully: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            duration: 500.0,
            delay: 0.0,
            end_delay: 0.0,
            playback_rate: 1.0,
            easing: "linear".to_string(),
            composite: Composite::Replace,
            starts_with_previous: false,
            starts_next_unit_too: false,
            commits_final_state: false,
            commit_forcefully: false,
        }
    }
}

impl UnitConfig {
    /// Apply every field set in a patch
    pub fn apply(&mut self, patch: &UnitConfigPatch) {
        if let Some(duration) = patch.duration {
            self.duration = duration;
        }
        if let Some(delay) = patch.delay {
            self.delay = delay;
        }
        if let Some(end_delay) = patch.end_delay {
            self.end_delay = end_delay;
        }
        if let Some(rate) = patch.playback_rate {
            self.playback_rate = rate;
        }
        if let Some(easing) = &patch.easing {
            self.easing.clone_from(easing);
        }
        if let Some(composite) = patch.composite {
            self.composite = composite;
        }
        if let Some(flag) = patch.starts_with_previous {
            self.starts_with_previous = flag;
        }
        if let Some(flag) = patch.starts_next_unit_too {
            self.starts_next_unit_too = flag;
        }
        if let Some(flag) = patch.commits_final_state {
            self.commits_final_state = flag;
        }
        if let Some(flag) = patch.commit_forcefully {
            self.commit_forcefully = flag;
        }
    }

    /// Validate timing values. A zero duration is raised to [`MIN_DURATION`].
    pub fn validated(mut self) -> Result<Self, ConfigurationError> {
        for (field, value) in [
            ("duration", self.duration),
            ("delay", self.delay),
            ("end delay", self.end_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidTiming { field, value });
            }
        }
        if !self.playback_rate.is_finite() || self.playback_rate <= 0.0 {
            return Err(ConfigurationError::InvalidPlaybackRate(self.playback_rate));
        }
        self.duration = self.duration.max(MIN_DURATION);
        Ok(self)
    }
}

/// Partial unit configuration; unset fields leave the target untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfigPatch {
    /// Active phase length (ms)
    pub duration: Option<f64>,
    /// Delay phase length (ms)
    pub delay: Option<f64>,
    /// End-delay phase length (ms)
    pub end_delay: Option<f64>,
    /// Base playback rate
    pub playback_rate: Option<f64>,
    /// Easing name
    pub easing: Option<String>,
    /// Composite operation
    pub composite: Option<Composite>,
    /// Start together with the previous unit
    pub starts_with_previous: Option<bool>,
    /// Make the next unit start together with this one
    pub starts_next_unit_too: Option<bool>,
    /// Persist the end state after the active phase
    pub commits_final_state: Option<bool>,
    /// Retry persisting forcefully
    pub commit_forcefully: Option<bool>,
}

impl UnitConfigPatch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active phase length
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Set the delay phase length
    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the end-delay phase length
    pub fn with_end_delay(mut self, end_delay: f64) -> Self {
        self.end_delay = Some(end_delay);
        self
    }

    /// Set the base playback rate
    pub fn with_playback_rate(mut self, rate: f64) -> Self {
        self.playback_rate = Some(rate);
        self
    }

    /// Set the easing name
    pub fn with_easing(mut self, easing: impl Into<String>) -> Self {
        self.easing = Some(easing.into());
        self
    }

    /// Start together with the previous unit
    pub fn starting_with_previous(mut self) -> Self {
        self.starts_with_previous = Some(true);
        self
    }

    /// Make the next unit start together with this one
    pub fn starting_next_unit_too(mut self) -> Self {
        self.starts_next_unit_too = Some(true);
        self
    }

    /// Persist the end state, optionally retrying forcefully
    pub fn committing_final_state(mut self, forcefully: bool) -> Self {
        self.commits_final_state = Some(true);
        self.commit_forcefully = Some(forcefully);
        self
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Human-readable description
    pub description: String,
    /// Free-form tag used by orchestrators to find the scheduler
    pub tag: String,
    /// Playback rate compounded into every unit
    pub playback_rate: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            description: "Untitled Sequence".to_string(),
            tag: String::new(),
            playback_rate: 1.0,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with a description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Set the playback rate
    pub fn with_playback_rate(mut self, rate: f64) -> Self {
        self.playback_rate = rate;
        self
    }

    /// Reject a playback rate that is not finite and positive
    pub fn validated(self) -> Result<Self, ConfigurationError> {
        if !self.playback_rate.is_finite() || self.playback_rate <= 0.0 {
            return Err(ConfigurationError::InvalidPlaybackRate(self.playback_rate));
        }
        Ok(self)
    }
}

/// One unit entry of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Effect kind
    pub kind: KindTag,
    /// Target label handed to the host
    #[serde(default)]
    pub target: String,
    /// Configuration overrides
    #[serde(default)]
    pub config: UnitConfigPatch,
    /// Forward keyframes
    #[serde(default)]
    pub keyframes: Vec<Keyframe>,
}

/// A scheduler and its units, as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceManifest {
    /// Format version
    #[serde(default = "default_manifest_version")]
    pub version: u32,
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Units in playback order
    #[serde(default)]
    pub units: Vec<UnitSpec>,
}

fn default_manifest_version() -> u32 {
    MANIFEST_FORMAT_VERSION
}

impl SequenceManifest {
    /// Parse a manifest from RON
    pub fn from_ron(source: &str) -> Result<Self, ConfigurationError> {
        let mut manifest: SequenceManifest =
            ron::from_str(source).map_err(|e| ConfigurationError::Manifest(e.to_string()))?;

        if manifest.version > MANIFEST_FORMAT_VERSION {
            return Err(ConfigurationError::UnsupportedManifestVersion {
                found: manifest.version,
                supported: MANIFEST_FORMAT_VERSION,
            });
        }

        manifest.scheduler = manifest.scheduler.validated()?;
        Ok(manifest)
    }

    /// Serialize to pretty RON
    pub fn to_ron(&self) -> Result<String, ConfigurationError> {
        let config = ron::ser::PrettyConfig::default()
            .struct_names(true)
            .enumerate_arrays(false);

        ron::ser::to_string_pretty(self, config).map_err(|e| ConfigurationError::Manifest(e.to_string()))
    }

    /// Load a manifest from a file
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ron(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Save the manifest to a file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = self
            .to_ron()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)
    }
}
