//! Stream definitions file.
//!
//! ```yaml
//! pi_endpoint: tcp://192.168.1.4:5555
//! streams:
//!   - name: front
//!     device: /dev/video0
//!     width: 1280
//!     height: 720
//!     fps: 30
//!     port: 5000
//!     channel_order: GRB
//! ```

use super::frame::{ChannelOrder, FrameGeometry};
use super::receiver::ReceiverSpec;
use super::rpc::{StreamRequest, VideoFormat};
use crate::transport::Endpoint;
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

fn default_port() -> u16 {
    5000
}

fn default_latency() -> u32 {
    60
}

fn default_enabled() -> bool {
    true
}

/// One camera stream as configured on the topside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(default)]
    pub video_format: VideoFormat,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_latency")]
    pub latency_ms: u32,
    #[serde(default)]
    pub channel_order: ChannelOrder,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl StreamSpec {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }

    /// `start_stream` arguments asking the vehicle to send to `host`.
    pub fn request(&self, host: &str) -> StreamRequest {
        StreamRequest {
            name: self.name.clone(),
            device: self.device.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            video_format: self.video_format,
            host: host.to_string(),
            port: self.port,
        }
    }

    /// Local receiver listening on every interface.
    pub fn receiver(&self) -> ReceiverSpec {
        ReceiverSpec {
            name: self.name.clone(),
            format: self.video_format,
            bind_address: "0.0.0.0".to_string(),
            port: self.port,
            latency_ms: self.latency_ms,
            geometry: self.geometry(),
        }
    }
}

/// Parsed stream definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamCatalog {
    #[serde(default)]
    pub pi_endpoint: Option<String>,
    /// Topside address override; also accepted as `windows_host`.
    #[serde(default, alias = "windows_host")]
    pub receive_host: Option<String>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
}

impl StreamCatalog {
    /// Load a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| LinkError::io(path, e))?;
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Self::from_json(&text),
            Some("yaml" | "yml") => Self::from_yaml(&text),
            _ => Err(LinkError::config(format!(
                "{}: stream definitions must be .json, .yaml or .yml",
                path.display()
            ))),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let catalog: Self =
            serde_json::from_str(text).map_err(|e| LinkError::config(format!("stream definitions: {e}")))?;
        catalog.validated()
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let catalog: Self =
            serde_yaml_ng::from_str(text).map_err(|e| LinkError::config(format!("stream definitions: {e}")))?;
        catalog.validated()
    }

    /// Drop disabled streams, reject duplicates and empty geometry.
    fn validated(mut self) -> Result<Self> {
        self.streams.retain(|stream| stream.enabled);

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for stream in &self.streams {
            if stream.name.trim().is_empty() {
                return Err(LinkError::config("stream with empty name"));
            }
            if !names.insert(stream.name.as_str()) {
                return Err(LinkError::config(format!("duplicate stream name '{}'", stream.name)));
            }
            if !ports.insert(stream.port) {
                return Err(LinkError::config(format!("stream '{}' reuses port {}", stream.name, stream.port)));
            }
            if stream.width == 0 || stream.height == 0 {
                return Err(LinkError::config(format!("stream '{}' has zero width or height", stream.name)));
            }
        }
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|stream| stream.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&StreamSpec> {
        self.streams.iter().find(|stream| stream.name == name)
    }

    /// The video control endpoint named in the file, if any.
    pub fn video_endpoint(&self) -> Result<Option<Endpoint>> {
        self.pi_endpoint.as_deref().map(Endpoint::parse).transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JSON: &str = r#"{
        "pi_endpoint": "tcp://10.0.0.2:5555",
        "windows_host": "10.0.0.1",
        "streams": [
            {"name": "front", "device": "/dev/video0", "width": 1280, "height": 720, "fps": 30},
            {"name": "claw", "device": "/dev/video2", "width": 640, "height": 480, "fps": 15,
             "video_format": "h264", "port": 5002, "channel_order": "grb"},
            {"name": "spare", "device": "/dev/video4", "width": 640, "height": 480, "fps": 15,
             "port": 5000, "enabled": false}
        ]
    }"#;

    #[test]
    fn json_defaults_and_disabled_streams() {
        let catalog = StreamCatalog::from_json(JSON).unwrap();
        assert_eq!(catalog.names().collect::<Vec<_>>(), ["front", "claw"]);
        assert_eq!(catalog.receive_host.as_deref(), Some("10.0.0.1"));
        assert_eq!(catalog.video_endpoint().unwrap(), Some(Endpoint::tcp("10.0.0.2", 5555)));

        let front = catalog.get("front").unwrap();
        assert_eq!((front.port, front.latency_ms, front.video_format), (5000, 60, VideoFormat::Mjpeg));
        assert_eq!(front.channel_order, ChannelOrder::Bgr);
        let claw = catalog.get("claw").unwrap();
        assert_eq!(claw.channel_order, ChannelOrder::Grb);
        assert_eq!(claw.receiver().format, VideoFormat::H264);
        assert_eq!(claw.request("10.0.0.1").host, "10.0.0.1");
    }

    #[test]
    fn yaml_file_loads_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "streams:\n  - name: front\n    device: /dev/video0\n    width: 640\n    height: 480\n    fps: 30\n    port: 5004"
        )
        .unwrap();
        let catalog = StreamCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.get("front").unwrap().port, 5004);
        assert_eq!(catalog.video_endpoint().unwrap(), None);
    }

    #[test]
    fn duplicates_are_rejected() {
        let dup_name = r#"{"streams": [
            {"name": "a", "device": "/dev/video0", "width": 1, "height": 1, "fps": 1, "port": 1},
            {"name": "a", "device": "/dev/video1", "width": 1, "height": 1, "fps": 1, "port": 2}]}"#;
        let dup_port = r#"{"streams": [
            {"name": "a", "device": "/dev/video0", "width": 1, "height": 1, "fps": 1},
            {"name": "b", "device": "/dev/video1", "width": 1, "height": 1, "fps": 1}]}"#;
        assert!(matches!(StreamCatalog::from_json(dup_name), Err(LinkError::Config { .. })));
        assert!(matches!(StreamCatalog::from_json(dup_port), Err(LinkError::Config { .. })));
    }

    #[test]
    fn unsupported_extension_and_bad_values() {
        assert!(matches!(StreamCatalog::load("/tmp/streams.toml"), Err(LinkError::Io { .. } | LinkError::Config { .. })));
        let bad_order = r#"{"streams": [{"name": "a", "device": "d", "width": 1, "height": 1, "fps": 1, "channel_order": "XYZ"}]}"#;
        assert!(StreamCatalog::from_json(bad_order).is_err());
    }
}
