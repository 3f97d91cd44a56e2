//! Per-tick frame construction: axis shaping, edges, and local mode state.

use crate::config::{GainConfig, UplinkConfig};
use crate::types::{
    Axes, Button, Buttons, CommandFrame, EdgeSet, InputSnapshot, ModeKey, ModeValue, Modes, RawInput,
    SCHEMA_VERSION, SEQUENCE_WRAP,
};

/// Zero a stick value inside the deadzone; pass it through unchanged above it.
pub fn apply_deadzone(value: f64, deadzone: f64) -> f64 {
    if !value.is_finite() || value.abs() < deadzone {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

fn clamp_trigger(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}

pub fn shape_axes(raw: &Axes, deadzone: f64) -> Axes {
    Axes {
        lx: apply_deadzone(raw.lx, deadzone),
        ly: apply_deadzone(raw.ly, deadzone),
        rx: apply_deadzone(raw.rx, deadzone),
        ry: apply_deadzone(raw.ry, deadzone),
        lt: clamp_trigger(raw.lt),
        rt: clamp_trigger(raw.rt),
    }
}

/// Authoritative operator mode state.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeState {
    depth_hold: bool,
    max_gain: f64,
    gain: GainConfig,
}

impl ModeState {
    pub fn new(hold_default: bool, gain: GainConfig) -> Self {
        let gain = gain.normalized();
        Self { depth_hold: hold_default, max_gain: round_gain(gain.default), gain }
    }

    pub fn depth_hold(&self) -> bool {
        self.depth_hold
    }

    pub fn max_gain(&self) -> f64 {
        self.max_gain
    }

    pub fn toggle_depth_hold(&mut self) {
        self.depth_hold = !self.depth_hold;
    }

    /// Move the gain cap by `delta`, clamped and snapped to 0.01. Returns true if it changed.
    pub fn adjust_gain(&mut self, delta: f64) -> bool {
        if delta == 0.0 || !delta.is_finite() {
            return false;
        }
        let previous = self.max_gain;
        self.max_gain = round_gain((previous + delta).clamp(self.gain.min, self.gain.max));
        (self.max_gain - previous).abs() > 1e-9
    }

    pub fn to_modes(&self) -> Modes {
        let mut modes = Modes::new();
        modes.insert(ModeKey::DepthHold, ModeValue::Flag(self.depth_hold));
        modes.insert(ModeKey::MaxGain, ModeValue::Level(self.max_gain));
        modes
    }
}

fn round_gain(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Builds one [`CommandFrame`] per tick.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    deadzone: f64,
    hold_button: Button,
    gain_step: f64,
    modes: ModeState,
    previous: Option<Buttons>,
    seq: u64,
}

impl FrameBuilder {
    pub fn new(config: &UplinkConfig) -> Self {
        let gain = config.gain.normalized();
        Self {
            deadzone: config.deadzone,
            hold_button: config.hold_toggle_button,
            gain_step: gain.step,
            modes: ModeState::new(config.hold_default, gain),
            previous: None,
            seq: 0,
        }
    }

    /// Forget the previous buttons so the next tick reports no edges.
    pub fn reset_edges(&mut self) {
        self.previous = None;
    }

    pub fn modes(&self) -> &ModeState {
        &self.modes
    }

    /// Sequence number the next frame will carry.
    pub fn next_seq(&self) -> u64 {
        self.seq
    }

    /// Shape a raw sample and compute its edges.
    pub fn snapshot(&mut self, raw: &RawInput) -> InputSnapshot {
        let edges = match &self.previous {
            Some(previous) => raw.buttons.edges_since(previous),
            None => EdgeSet::new(),
        };
        self.previous = Some(raw.buttons);
        InputSnapshot { axes: shape_axes(&raw.axes, self.deadzone), buttons: raw.buttons, dpad: raw.dpad, edges }
    }

    /// Produce the frame for this tick at wall-clock time `ts`.
    pub fn tick(&mut self, raw: &RawInput, ts: f64) -> CommandFrame {
        let snapshot = self.snapshot(raw);

        if snapshot.pressed(self.hold_button) {
            self.modes.toggle_depth_hold();
        }
        if snapshot.pressed(Button::Y) {
            self.modes.adjust_gain(self.gain_step);
        }
        if snapshot.pressed(Button::A) {
            self.modes.adjust_gain(-self.gain_step);
        }

        let seq = self.seq;
        self.seq = (self.seq + 1) % SEQUENCE_WRAP;

        CommandFrame {
            schema: SCHEMA_VERSION,
            seq,
            ts,
            axes: snapshot.axes,
            buttons: snapshot.buttons,
            dpad: snapshot.dpad,
            edges: snapshot.edges,
            modes: self.modes.to_modes(),
        }
    }
}
