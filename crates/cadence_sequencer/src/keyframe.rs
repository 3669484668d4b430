// SPDX-License-Identifier: MIT OR Apache-2.0
//! Keyframes handed to effect hosts and sampled by tween fraction.

use serde::{Deserialize, Serialize};

/// Interpolation mode between keyframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InterpolationMode {
    /// Constant (step)
    Constant,
    /// Linear interpolation
    #[default]
    Linear,
}

/// Value stored in a keyframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyframeValue {
    /// Float value
    Float(f32),
    /// 2D vector
    Vec2([f32; 2]),
    /// 3D vector
    Vec3([f32; 3]),
    /// 4D vector / quaternion
    Vec4([f32; 4]),
    /// Color (RGBA)
    Color([f32; 4]),
    /// Boolean
    Bool(bool),
    /// Opaque token (class name, visibility keyword, ...)
    Token(String),
}

/// A keyframe at a fractional offset of the active phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Offset within the active phase (0..=1)
    pub offset: f32,
    /// Value at this keyframe
    pub value: KeyframeValue,
    /// Interpolation mode to next keyframe
    #[serde(default)]
    pub interpolation: InterpolationMode,
}

impl Keyframe {
    /// Create a new keyframe
    pub fn new(offset: f32, value: KeyframeValue) -> Self {
        Self {
            offset: offset.clamp(0.0, 1.0),
            value,
            interpolation: InterpolationMode::Linear,
        }
    }

    /// Set interpolation mode
    pub fn with_interpolation(mut self, mode: InterpolationMode) -> Self {
        self.interpolation = mode;
        self
    }
}

/// Interpolation utilities
pub struct Interpolation;

impl Interpolation {
    /// Linear interpolation between two floats
    pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
        a + (b - a) * t
    }

    /// Interpolate Vec2
    pub fn lerp_vec2(a: [f32; 2], b: [f32; 2], t: f32) -> [f32; 2] {
        [Self::lerp(a[0], b[0], t), Self::lerp(a[1], b[1], t)]
    }

    /// Interpolate Vec3
    pub fn lerp_vec3(a: [f32; 3], b: [f32; 3], t: f32) -> [f32; 3] {
        [
            Self::lerp(a[0], b[0], t),
            Self::lerp(a[1], b[1], t),
            Self::lerp(a[2], b[2], t),
        ]
    }

    /// Interpolate Vec4
    pub fn lerp_vec4(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
        [
            Self::lerp(a[0], b[0], t),
            Self::lerp(a[1], b[1], t),
            Self::lerp(a[2], b[2], t),
            Self::lerp(a[3], b[3], t),
        ]
    }

    /// Spherical linear interpolation for quaternions
    pub fn slerp(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
        let mut dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2] + a[3] * b[3];

        // Take the short way round
        let mut b = b;
        if dot < 0.0 {
            b = [-b[0], -b[1], -b[2], -b[3]];
            dot = -dot;
        }

        if dot > 0.9995 {
            let result = Self::lerp_vec4(a, b, t);
            let len = (result[0] * result[0] + result[1] * result[1]
                + result[2] * result[2] + result[3] * result[3])
                .sqrt();
            return [result[0] / len, result[1] / len, result[2] / len, result[3] / len];
        }

        let theta_0 = dot.acos();
        let theta = theta_0 * t;
        let sin_theta = theta.sin();
        let sin_theta_0 = theta_0.sin();

        let s0 = (theta_0 - theta).cos() - dot * sin_theta / sin_theta_0;
        let s1 = sin_theta / sin_theta_0;

        [
            a[0] * s0 + b[0] * s1,
            a[1] * s0 + b[1] * s1,
            a[2] * s0 + b[2] * s1,
            a[3] * s0 + b[3] * s1,
        ]
    }
}

impl KeyframeValue {
    /// Interpolate between two keyframe values. Mismatched kinds yield `None`.
    pub fn interpolate(&self, other: &KeyframeValue, t: f32, mode: InterpolationMode) -> Option<KeyframeValue> {
        if mode == InterpolationMode::Constant {
            return Some(self.clone());
        }
        match (self, other) {
            (KeyframeValue::Float(a), KeyframeValue::Float(b)) => {
                Some(KeyframeValue::Float(Interpolation::lerp(*a, *b, t)))
            }
            (KeyframeValue::Vec2(a), KeyframeValue::Vec2(b)) => {
                Some(KeyframeValue::Vec2(Interpolation::lerp_vec2(*a, *b, t)))
            }
            (KeyframeValue::Vec3(a), KeyframeValue::Vec3(b)) => {
                Some(KeyframeValue::Vec3(Interpolation::lerp_vec3(*a, *b, t)))
            }
            (KeyframeValue::Vec4(a), KeyframeValue::Vec4(b)) => {
                Some(KeyframeValue::Vec4(Interpolation::slerp(*a, *b, t)))
            }
            (KeyframeValue::Color(a), KeyframeValue::Color(b)) => {
                Some(KeyframeValue::Color(Interpolation::lerp_vec4(*a, *b, t)))
            }
            // Discrete values flip at the far keyframe
            (KeyframeValue::Bool(_), KeyframeValue::Bool(_))
            | (KeyframeValue::Token(_), KeyframeValue::Token(_)) => {
                Some(if t < 1.0 { self.clone() } else { other.clone() })
            }
            _ => None,
        }
    }
}

impl KeyframeValue {
    /// Get as float if possible
    pub fn as_float(&self) -> Option<f32> {
        match self {
            KeyframeValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Sort keyframes by offset
pub fn sort_keyframes(frames: &mut [Keyframe]) {
    frames.sort_by(|a, b| a.offset.total_cmp(&b.offset));
}

/// Mirror keyframes so that sampling at `t` yields the original value at `1 - t`
pub fn reversed(frames: &[Keyframe]) -> Vec<Keyframe> {
    let mut mirrored: Vec<Keyframe> = frames
        .iter()
        .map(|kf| Keyframe {
            offset: 1.0 - kf.offset,
            ..kf.clone()
        })
        .collect();
    sort_keyframes(&mut mirrored);

    // Interpolation modes describe the segment after a keyframe; shift them
    // so each segment keeps its mode once the order flips.
    let modes: Vec<InterpolationMode> = frames.iter().map(|kf| kf.interpolation).collect();
    let count = mirrored.len();
    for (index, kf) in mirrored.iter_mut().enumerate() {
        let source = count - 1 - index;
        if source > 0 {
            kf.interpolation = modes[source - 1];
        }
    }
    mirrored
}

/// Sample sorted keyframes at a tween fraction
pub fn sample(frames: &[Keyframe], t: f32) -> Option<KeyframeValue> {
    let first = frames.first()?;
    let next_idx = frames.iter().position(|k| k.offset >= t);

    match next_idx {
        None => frames.last().map(|kf| kf.value.clone()),
        Some(0) => Some(first.value.clone()),
        Some(idx) => {
            let a = &frames[idx - 1];
            let b = &frames[idx];
            if (b.offset - a.offset).abs() < 0.0001 {
                return Some(b.value.clone());
            }
            let local = (t - a.offset) / (b.offset - a.offset);
            a.value.interpolate(&b.value, local, a.interpolation)
        }
    }
}
