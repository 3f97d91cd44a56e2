//! Outbound command frame and its mode map.

use super::input::{Axes, Buttons, Dpad, EdgeSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version stamped into every frame; bump when the wire shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// How long the vehicle should treat a frame as fresh, in seconds.
pub const DEFAULT_FRAME_TTL: f64 = 0.5;

/// Sequence numbers wrap here so they stay exact as JSON numbers.
pub const SEQUENCE_WRAP: u64 = 1 << 53;

/// Operator-toggled settings carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKey {
    DepthHold,
    MaxGain,
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeKey::DepthHold => f.write_str("depth_hold"),
            ModeKey::MaxGain => f.write_str("max_gain"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModeValue {
    Flag(bool),
    Level(f64),
}

impl ModeValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ModeValue::Flag(flag) => Some(*flag),
            ModeValue::Level(_) => None,
        }
    }

    pub fn as_level(&self) -> Option<f64> {
        match self {
            ModeValue::Level(level) => Some(*level),
            ModeValue::Flag(_) => None,
        }
    }
}

/// Full mode state; always sent whole, never as a delta.
pub type Modes = BTreeMap<ModeKey, ModeValue>;

/// One pilot command as published on the control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "pilot")]
pub struct CommandFrame {
    pub schema: u32,
    pub seq: u64,
    /// Wall-clock send time in epoch seconds.
    pub ts: f64,
    pub axes: Axes,
    pub buttons: Buttons,
    pub dpad: Dpad,
    #[serde(default)]
    pub edges: EdgeSet,
    #[serde(default)]
    pub modes: Modes,
}

impl CommandFrame {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> crate::Result<Self> {
        serde_json::from_str(payload).map_err(|e| crate::LinkError::malformed("command frame", e.to_string()))
    }

    /// Whether the frame is still within `ttl` seconds of `now`.
    pub fn is_fresh(&self, now: f64, ttl: f64) -> bool {
        now - self.ts <= ttl
    }

    pub fn depth_hold(&self) -> Option<bool> {
        self.modes.get(&ModeKey::DepthHold).and_then(ModeValue::as_flag)
    }

    pub fn max_gain(&self) -> Option<f64> {
        self.modes.get(&ModeKey::MaxGain).and_then(ModeValue::as_level)
    }
}
