//! Runtime configuration.
//!
//! A [`LinkConfig`] is built once at startup, from the environment and then
//! command-line overrides, and handed by reference to each component. Values
//! that fail to parse are reported as [`LinkError::Config`] rather than
//! silently replaced by defaults.

use crate::backoff::BackoffPolicy;
use crate::transport::Endpoint;
use crate::types::Button;
use crate::{LinkError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ROV_HOST: &str = "192.168.1.4";

/// Highest accepted command publish rate.
pub const MAX_PUBLISH_HZ: f64 = 1000.0;
pub const DEFAULT_PILOT_PORT: u16 = 6000;
pub const DEFAULT_SENSOR_PORT: u16 = 6001;
pub const DEFAULT_VIDEO_RPC_PORT: u16 = 5555;

/// Bounds and step for the pilot-adjustable gain cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainConfig {
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self { default: 1.0, min: 0.05, max: 1.0, step: 0.05 }
    }
}

impl GainConfig {
    /// Swap an inverted range, clamp the default into it, and floor the step at zero.
    pub fn normalized(self) -> Self {
        let (min, max) = if self.max < self.min { (self.max, self.min) } else { (self.min, self.max) };
        Self { default: self.default.clamp(min, max), min, max, step: self.step.max(0.0) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UplinkConfig {
    pub rate_hz: f64,
    pub deadzone: f64,
    pub health_check_period: Duration,
    pub reopen_backoff: BackoffPolicy,
    pub hold_toggle_button: Button,
    pub hold_default: bool,
    pub gain: GainConfig,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            rate_hz: 30.0,
            deadzone: 0.15,
            health_check_period: Duration::from_millis(500),
            reopen_backoff: BackoffPolicy::input_reopen(),
            hold_toggle_button: Button::Rstick,
            hold_default: false,
            gain: GainConfig::default(),
        }
    }
}

impl UplinkConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkConfig {
    pub poll_interval: Duration,
    pub stale_reconnect_timeout: Duration,
    pub initial_timeout: Duration,
    /// Pause between closing and recreating the socket.
    pub reset_pause: Duration,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            stale_reconnect_timeout: Duration::from_secs(3),
            initial_timeout: Duration::from_secs(5),
            reset_pause: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfig {
    pub rpc_timeout: Duration,
    pub stall_timeout: Duration,
    /// No frame within this long after (re)starting counts as a stall.
    pub first_frame_timeout: Duration,
    pub retry_backoff: BackoffPolicy,
    pub stall_retry_delay: Duration,
    pub tick: Duration,
    pub warm_stagger: Duration,
    pub warm_keep: bool,
    /// Address the vehicle should send RTP to; discovered from the route when unset.
    pub receive_host: Option<String>,
    pub gst_launch: Option<PathBuf>,
    pub kill_allow_list: Vec<String>,
    pub terminate_grace: Duration,
    /// Recovery notices kept for display per session.
    pub max_notices: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(2),
            first_frame_timeout: Duration::from_secs(5),
            retry_backoff: BackoffPolicy::video_retry(),
            stall_retry_delay: Duration::from_millis(200),
            tick: Duration::from_millis(250),
            warm_stagger: Duration::from_millis(1500),
            warm_keep: false,
            receive_host: None,
            gst_launch: None,
            kill_allow_list: vec!["gst-launch-1.0".to_string()],
            terminate_grace: Duration::from_millis(800),
            max_notices: 3,
        }
    }
}

/// Complete topside link configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub rov_host: String,
    pub control_endpoint: Endpoint,
    pub telemetry_endpoint: Endpoint,
    pub video_rpc_endpoint: Endpoint,
    pub uplink: UplinkConfig,
    pub downlink: DownlinkConfig,
    pub video: VideoConfig,
    /// Bound on joining any worker during shutdown.
    pub stop_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::for_host(DEFAULT_ROV_HOST)
    }
}

impl LinkConfig {
    /// Defaults with every endpoint pointing at `host`.
    pub fn for_host(host: &str) -> Self {
        Self {
            rov_host: host.to_string(),
            control_endpoint: Endpoint::tcp(host, DEFAULT_PILOT_PORT),
            telemetry_endpoint: Endpoint::tcp(host, DEFAULT_SENSOR_PORT),
            video_rpc_endpoint: Endpoint::tcp(host, DEFAULT_VIDEO_RPC_PORT),
            uplink: UplinkConfig::default(),
            downlink: DownlinkConfig::default(),
            video: VideoConfig::default(),
            stop_timeout: Duration::from_secs(1),
        }
    }

    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("ROV_HOST").unwrap_or_else(|| DEFAULT_ROV_HOST.to_string());
        let mut config = Self::for_host(&host);

        if let Some(ep) = get("ROV_PILOT_EP") {
            config.control_endpoint = Endpoint::parse(&ep)?;
        }
        if let Some(ep) = get("ROV_SENSOR_EP") {
            config.telemetry_endpoint = Endpoint::parse(&ep)?;
        }
        if let Some(ep) = get("ROV_VIDEO_RPC") {
            config.video_rpc_endpoint = Endpoint::parse(&ep)?;
        }

        let uplink = &mut config.uplink;
        set_parsed(&get, "ROVLINK_PUBLISH_HZ", &mut uplink.rate_hz)?;
        set_parsed(&get, "ROVLINK_DEADZONE", &mut uplink.deadzone)?;
        set_parsed(&get, "ROVLINK_HOLD_TOGGLE", &mut uplink.hold_toggle_button)?;
        if let Some(value) = get("ROVLINK_HOLD_DEFAULT") {
            uplink.hold_default = parse_flag("ROVLINK_HOLD_DEFAULT", &value)?;
        }
        set_parsed(&get, "ROVLINK_GAIN_DEFAULT", &mut uplink.gain.default)?;
        set_parsed(&get, "ROVLINK_GAIN_MIN", &mut uplink.gain.min)?;
        set_parsed(&get, "ROVLINK_GAIN_MAX", &mut uplink.gain.max)?;
        set_parsed(&get, "ROVLINK_GAIN_STEP", &mut uplink.gain.step)?;
        uplink.gain = uplink.gain.normalized();

        let downlink = &mut config.downlink;
        if let Some(ms) = get("ROVLINK_POLL_MS") {
            downlink.poll_interval = Duration::from_millis(parse_value("ROVLINK_POLL_MS", &ms)?);
        }
        set_secs(&get, "ROVLINK_STALE_S", &mut downlink.stale_reconnect_timeout)?;
        set_secs(&get, "ROVLINK_INITIAL_S", &mut downlink.initial_timeout)?;

        let video = &mut config.video;
        set_secs(&get, "ROVLINK_STALL_S", &mut video.stall_timeout)?;
        set_secs(&get, "ROVLINK_RPC_TIMEOUT_S", &mut video.rpc_timeout)?;
        video.receive_host = get("ROVLINK_RECEIVE_HOST");
        video.gst_launch = get("GST_LAUNCH").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Reject values the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rate = self.uplink.rate_hz;
        if !(rate.is_finite() && rate > 0.0 && rate <= MAX_PUBLISH_HZ) {
            return Err(LinkError::config(format!("publish rate must be in (0, {MAX_PUBLISH_HZ}] Hz, got {rate}")));
        }
        if !(0.0..1.0).contains(&self.uplink.deadzone) {
            return Err(LinkError::config(format!("deadzone must be in [0, 1), got {}", self.uplink.deadzone)));
        }
        let gain = self.uplink.gain;
        if !(gain.min.is_finite() && gain.max.is_finite() && gain.min > 0.0) {
            return Err(LinkError::config(format!("gain range must be positive, got [{}, {}]", gain.min, gain.max)));
        }
        let timeouts = [
            ("poll interval", self.downlink.poll_interval),
            ("stale reconnect timeout", self.downlink.stale_reconnect_timeout),
            ("initial timeout", self.downlink.initial_timeout),
            ("rpc timeout", self.video.rpc_timeout),
            ("stall timeout", self.video.stall_timeout),
            ("first frame timeout", self.video.first_frame_timeout),
            ("stop timeout", self.stop_timeout),
            ("video tick", self.video.tick),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(LinkError::config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Point every endpoint at a new host, keeping ports.
    pub fn with_host(mut self, host: &str) -> Self {
        self.rov_host = host.to_string();
        self.control_endpoint = Endpoint::tcp(host, self.control_endpoint.port());
        self.telemetry_endpoint = Endpoint::tcp(host, self.telemetry_endpoint.port());
        self.video_rpc_endpoint = Endpoint::tcp(host, self.video_rpc_endpoint.port());
        self
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| LinkError::config(format!("{key}: cannot parse '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LinkError::config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}

fn set_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()> {
    if let Some(value) = get(key) {
        *slot = parse_value(key, &value)?;
    }
    Ok(())
}

fn set_secs(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) -> Result<()> {
    if let Some(value) = get(key) {
        let secs: f64 = parse_value(key, &value)?;
        *slot = Duration::try_from_secs_f64(secs)
            .map_err(|_| LinkError::config(format!("{key}: '{value}' is not a valid duration")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_host() {
        let config = LinkConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.control_endpoint.to_string(), "tcp://192.168.1.4:6000");
        assert_eq!(config.telemetry_endpoint.to_string(), "tcp://192.168.1.4:6001");
        assert_eq!(config.video_rpc_endpoint.to_string(), "tcp://192.168.1.4:5555");
        assert_eq!(config.uplink.deadzone, 0.15);
        assert_eq!(config.uplink.hold_toggle_button, Button::Rstick);
        assert_eq!(config.downlink.poll_interval, Duration::from_millis(200));

        let config = LinkConfig::from_lookup(lookup(&[("ROV_HOST", "10.0.0.9")])).unwrap();
        assert_eq!(config.telemetry_endpoint.to_string(), "tcp://10.0.0.9:6001");
    }

    #[test]
    fn explicit_endpoints_win_over_host() {
        let config = LinkConfig::from_lookup(lookup(&[
            ("ROV_HOST", "10.0.0.9"),
            ("ROV_PILOT_EP", "tcp://127.0.0.1:7000"),
        ]))
        .unwrap();
        assert_eq!(config.control_endpoint.to_string(), "tcp://127.0.0.1:7000");
        assert_eq!(config.video_rpc_endpoint.host(), "10.0.0.9");
    }

    #[test]
    fn overrides_are_applied() {
        let config = LinkConfig::from_lookup(lookup(&[
            ("ROVLINK_PUBLISH_HZ", "50"),
            ("ROVLINK_DEADZONE", "0.1"),
            ("ROVLINK_HOLD_TOGGLE", "LStick"),
            ("ROVLINK_HOLD_DEFAULT", "yes"),
            ("ROVLINK_POLL_MS", "100"),
            ("ROVLINK_STALE_S", "1.5"),
            ("ROVLINK_STALL_S", "4"),
            ("GST_LAUNCH", "/opt/gst/bin/gst-launch-1.0"),
        ]))
        .unwrap();
        assert_eq!(config.uplink.rate_hz, 50.0);
        assert_eq!(config.uplink.period(), Duration::from_millis(20));
        assert_eq!(config.uplink.hold_toggle_button, Button::Lstick);
        assert!(config.uplink.hold_default);
        assert_eq!(config.downlink.poll_interval, Duration::from_millis(100));
        assert_eq!(config.downlink.stale_reconnect_timeout, Duration::from_millis(1500));
        assert_eq!(config.video.stall_timeout, Duration::from_secs(4));
        assert_eq!(config.video.gst_launch, Some(PathBuf::from("/opt/gst/bin/gst-launch-1.0")));
    }

    #[test]
    fn invalid_values_are_errors() {
        for (key, value) in [
            ("ROVLINK_PUBLISH_HZ", "fast"),
            ("ROVLINK_PUBLISH_HZ", "0"),
            ("ROVLINK_PUBLISH_HZ", "1e10"),
            ("ROVLINK_PUBLISH_HZ", "inf"),
            ("ROVLINK_DEADZONE", "1.0"),
            ("ROVLINK_HOLD_TOGGLE", "turbo"),
            ("ROVLINK_HOLD_DEFAULT", "maybe"),
            ("ROVLINK_STALE_S", "-1"),
            ("ROVLINK_RPC_TIMEOUT_S", "0"),
            ("ROV_SENSOR_EP", "localhost:6001"),
        ] {
            let result = LinkConfig::from_lookup(lookup(&[(key, value)]));
            assert!(matches!(result, Err(LinkError::Config { .. })), "{key}={value}");
        }
    }

    #[test]
    fn publish_rate_is_capped() {
        let mut config = LinkConfig::for_host("10.0.0.9");
        config.uplink.rate_hz = 1e10;
        assert!(matches!(config.validate(), Err(LinkError::Config { .. })));

        config.uplink.rate_hz = MAX_PUBLISH_HZ;
        assert!(config.validate().is_ok());
        assert!(!config.uplink.period().is_zero());
    }

    #[test]
    fn inverted_gain_range_is_swapped_and_default_clamped() {
        let config = LinkConfig::from_lookup(lookup(&[
            ("ROVLINK_GAIN_MIN", "0.8"),
            ("ROVLINK_GAIN_MAX", "0.2"),
            ("ROVLINK_GAIN_DEFAULT", "1.0"),
        ]))
        .unwrap();
        assert_eq!(config.uplink.gain.min, 0.2);
        assert_eq!(config.uplink.gain.max, 0.8);
        assert_eq!(config.uplink.gain.default, 0.8);
    }

    #[test]
    fn with_host_keeps_ports() {
        let config = LinkConfig::for_host("a").with_host("b");
        assert_eq!(config.rov_host, "b");
        assert_eq!(config.control_endpoint, Endpoint::tcp("b", 6000));
    }
}
