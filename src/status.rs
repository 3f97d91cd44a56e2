//! Operator-facing status lines.
//!
//! The console refreshes these a few times per second. Link health prefers
//! the heartbeat and falls back to any other sensor traffic; each signal keeps
//! its own [`HealthTracker`] so hysteresis is not reset by a source switch.

use crate::downlink::TelemetrySnapshot;
use crate::health::{HealthThresholds, HealthTracker, LinkStatus};
use crate::types::{CommandFrame, TelemetryMessage, TelemetryTag};
use crate::uplink::UplinkStatus;
use crate::video::{SessionState, SessionStatus};
use tokio::time::Instant;

/// Stateful link classifier for the status bar.
#[derive(Debug, Clone, Default)]
pub struct LinkMonitor {
    heartbeat: HealthTracker,
    sensors: HealthTracker,
}

impl LinkMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { heartbeat: HealthTracker::new(thresholds), sensors: HealthTracker::new(thresholds) }
    }

    /// Classify the freshest signal. Heartbeat wins whenever one was ever seen.
    pub fn link_status(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> LinkStatus {
        let heartbeat = snapshot.heartbeat_sample();
        if heartbeat.last_activity.is_some() {
            return self.heartbeat.update(heartbeat, now);
        }
        self.sensors.update(snapshot.sensor_sample(), now)
    }

    /// `Link: OK | pilot_age=0.05s | ARMED`, or `sensor_age=` without a heartbeat.
    pub fn link_line(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> String {
        let status = self.link_status(snapshot, now);
        let mut parts = vec![format!("Link: {status}")];

        if let Some(heartbeat) = snapshot.heartbeat() {
            if let Some(pilot_age) = heartbeat.pilot_age {
                parts.push(format!("pilot_age={pilot_age:.2}s"));
            }
            parts.push(if heartbeat.armed { "ARMED" } else { "disarmed" }.to_string());
        } else if let Some(age) = snapshot.sensor_sample().age(now) {
            parts.push(format!("sensor_age={:.2}s", age.as_secs_f64()));
        }
        parts.join(" | ")
    }
}

pub fn controller_line(status: &UplinkStatus) -> String {
    status.to_string()
}

/// `Video: cam (OK, age=0.1s)`; other states are shown by name.
pub fn video_line(name: Option<&str>, status: Option<&SessionStatus>) -> String {
    let (Some(name), Some(status)) = (name, status) else {
        return "Video: -".to_string();
    };
    match (status.state, status.age) {
        (SessionState::Playing, Some(age)) => format!("Video: {name} (OK, age={:.1}s)", age.as_secs_f64()),
        (SessionState::Playing, None) => format!("Video: {name} (OK)"),
        (state, _) => format!("Video: {name} ({state})"),
    }
}

/// Mode as last sent to the vehicle.
pub fn mode_line(frame: Option<&CommandFrame>) -> String {
    match frame.and_then(CommandFrame::depth_hold) {
        Some(true) => "Mode: DEPTH HOLD".to_string(),
        Some(false) => "Mode: MANUAL".to_string(),
        None => "Mode: -".to_string(),
    }
}

pub fn depth_line(snapshot: &TelemetrySnapshot) -> String {
    let Some(TelemetryMessage::ExternalDepth(depth)) = snapshot.get(&TelemetryTag::ExternalDepth).map(|r| &r.message)
    else {
        return "Depth: -".to_string();
    };
    let sensor = depth.sensor.as_deref().unwrap_or("depth");
    if depth.error.is_some() {
        return format!("Depth: {sensor} (ERR)");
    }
    let Some(depth_m) = depth.depth_m else {
        return format!("Depth: {sensor} -");
    };
    let mut line = format!("Depth: {sensor} {depth_m:.2}m");
    if let Some(pressure) = depth.pressure_mbar {
        line.push_str(&format!(" {pressure:.0}mbar"));
    }
    if let Some(temperature) = depth.temperature_c {
        line.push_str(&format!(" {temperature:.1}C"));
    }
    line
}

pub fn power_line(snapshot: &TelemetrySnapshot) -> String {
    let Some(TelemetryMessage::Power(power)) = snapshot.get(&TelemetryTag::Power).map(|r| &r.message) else {
        return "Power: -".to_string();
    };
    if power.error.is_some() {
        return "Power: (ERR)".to_string();
    }
    let volts = power.voltage_v.unwrap_or(0.0);
    let amps = power.current_a.unwrap_or(0.0);
    let watts = power.power_w.unwrap_or(volts * amps);
    let mut line = format!("Power: {volts:.2}V {amps:.2}A {watts:.0}W");
    if power.held {
        line.push_str(" (hold)");
    } else if !power.ok {
        line.push_str(" (check)");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TelemetryRecord;
    use std::time::Duration;

    fn snapshot(messages: &[(&str, u64)], start: Instant) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::default();
        for (raw, at_ms) in messages {
            let record = TelemetryRecord::parse(raw).unwrap();
            snapshot.apply(record, start + Duration::from_millis(*at_ms));
        }
        snapshot
    }

    #[test]
    fn heartbeat_drives_link_line() {
        let start = Instant::now();
        let snap = snapshot(
            &[
                (r#"{"type":"power","voltage_v":12.0}"#, 0),
                (r#"{"type":"heartbeat","armed":true,"pilot_age":0.05}"#, 0),
            ],
            start,
        );
        let mut monitor = LinkMonitor::default();
        assert_eq!(monitor.link_line(&snap, start + Duration::from_millis(100)), "Link: OK | pilot_age=0.05s | ARMED");
        assert_eq!(monitor.link_status(&snap, start + Duration::from_secs(10)), LinkStatus::Lost);
    }

    #[test]
    fn sensor_traffic_is_the_fallback() {
        let start = Instant::now();
        let snap = snapshot(&[(r#"{"type":"attitude"}"#, 0)], start);
        let mut monitor = LinkMonitor::default();
        assert_eq!(monitor.link_line(&snap, start + Duration::from_millis(250)), "Link: OK | sensor_age=0.25s");
        assert_eq!(LinkMonitor::default().link_line(&TelemetrySnapshot::default(), start), "Link: NO DATA");
    }

    #[test]
    fn readouts_match_console_format() {
        let start = Instant::now();
        let snap = snapshot(
            &[
                (r#"{"type":"external_depth","sensor":"bar30","depth_m":1.234,"pressure_mbar":1136.4,"temperature_c":14.27}"#, 0),
                (r#"{"type":"power","voltage_v":15.9,"current_a":2.5,"held":true}"#, 0),
            ],
            start,
        );
        assert_eq!(depth_line(&snap), "Depth: bar30 1.23m 1136mbar 14.3C");
        assert_eq!(power_line(&snap), "Power: 15.90V 2.50A 40W (hold)");

        let errs = snapshot(
            &[
                (r#"{"type":"external_depth","sensor":"bar30","error":"i2c"}"#, 0),
                (r#"{"type":"power","error":"adc"}"#, 0),
            ],
            start,
        );
        assert_eq!(depth_line(&errs), "Depth: bar30 (ERR)");
        assert_eq!(power_line(&errs), "Power: (ERR)");
        assert_eq!(depth_line(&TelemetrySnapshot::default()), "Depth: -");
    }

    #[test]
    fn video_and_controller_lines() {
        let playing = SessionStatus {
            state: SessionState::Playing,
            age: Some(Duration::from_millis(100)),
            last_error: None,
            notices: vec![],
        };
        assert_eq!(video_line(Some("cam"), Some(&playing)), "Video: cam (OK, age=0.1s)");
        let stalled = SessionStatus { state: SessionState::Stalled, ..playing };
        assert_eq!(video_line(Some("cam"), Some(&stalled)), "Video: cam (stalled)");
        assert_eq!(video_line(None, None), "Video: -");

        let connected = UplinkStatus::Connected { device: "Xbox".into(), max_gain: 1.0 };
        assert_eq!(controller_line(&connected), "Controller: OK (Xbox)");
        let lost = UplinkStatus::Disconnected { reason: "unplugged".into() };
        assert_eq!(controller_line(&lost), "Controller: - (unplugged)");
        assert_eq!(mode_line(None), "Mode: -");
    }
}
