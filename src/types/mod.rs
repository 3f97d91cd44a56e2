//! Wire and sample types shared by the uplink, downlink and console.
//!
//! - [`InputSnapshot`] is one shaped operator sample with its button edges
//! - [`CommandFrame`] is the JSON object published on the control endpoint
//! - [`TelemetryRecord`] is one decoded message from the telemetry endpoint

mod command;
mod input;
mod telemetry;

pub use command::{
    CommandFrame, DEFAULT_FRAME_TTL, ModeKey, ModeValue, Modes, SCHEMA_VERSION, SEQUENCE_WRAP,
};
pub use input::{Axes, Button, Buttons, Dpad, Edge, EdgeSet, InputSnapshot, RawInput};
pub use telemetry::{
    Attitude, AttitudeHealth, ExternalDepth, Heartbeat, NetLink, NetStatus, Power, RollPitchYaw,
    TelemetryMessage, TelemetryRecord, TelemetryTag, UNTAGGED,
};
