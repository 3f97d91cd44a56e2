//! Request/reply client for the vehicle's video service.
//!
//! Requests are `{"cmd": ..., "args": {...}}`; replies are
//! `{"ok": bool, "data"?, "error"?, "messages"?}`. A REQ socket that fails
//! mid-exchange cannot be reused, so any error drops the socket and the next
//! call connects afresh.

use crate::transport::{Endpoint, LinkOptions, Requester, RequesterConnector};
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    cmd: &'a str,
    args: Value,
}

/// Raw reply envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcReply {
    pub ok: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Non-fatal notices from the vehicle, such as a camera USB rebind.
    pub messages: Vec<String>,
}

/// Result of a successful `start_stream`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReply {
    pub data: Value,
    pub messages: Vec<String>,
}

/// Encoding the vehicle should send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mjpeg,
    H264,
}

/// Arguments of `start_stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamRequest {
    pub name: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_format: VideoFormat,
    /// Topside address the vehicle sends RTP to.
    pub host: String,
    pub port: u16,
}

/// Format flags reported for a capture device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CapsFlags {
    pub supports_mjpeg: bool,
    pub supports_h264: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
    pub fps: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceMode {
    pub format: String,
    pub description: Option<String>,
    pub sizes: Vec<FrameSize>,
}

/// One `/dev/video*` node on the vehicle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub device: String,
    pub label: Option<String>,
    pub exists: bool,
    pub caps_flags: CapsFlags,
    #[serde(alias = "formats")]
    pub modes: Vec<DeviceMode>,
}

/// Labels of codec and ISP helper nodes that are never cameras.
const HELPER_LABELS: &[&str] = &[
    "bcm2835-codec",
    "bcm2835-isp",
    "rpi-hevc",
    "image_fx",
    "isp-output",
    "isp-capture",
    "codec-encode",
    "codec-decode",
];

impl DeviceInfo {
    /// Heuristic filter for user-facing cameras among all video nodes.
    pub fn is_probably_camera(&self) -> bool {
        if !self.exists {
            return false;
        }
        let label = self.label.as_deref().unwrap_or_default().to_lowercase();
        if HELPER_LABELS.iter().any(|helper| label.contains(helper)) {
            return false;
        }
        let index = self.device.strip_prefix("/dev/video").and_then(|n| n.parse::<u32>().ok());
        if index.is_some_and(|i| i >= 10) && !(self.caps_flags.supports_mjpeg || self.caps_flags.supports_h264) {
            return false;
        }
        self.modes
            .iter()
            .flat_map(|mode| &mode.sizes)
            .any(|size| size.width >= 320 && size.height >= 240)
    }
}

/// Client for the video control endpoint. Owned by one task.
pub struct VideoControl<C: ?Sized> {
    connector: Arc<C>,
    endpoint: Endpoint,
    options: LinkOptions,
    timeout: Duration,
    socket: Option<Box<dyn Requester>>,
}

impl<C> VideoControl<C>
where
    C: RequesterConnector + ?Sized,
{
    pub fn new(connector: Arc<C>, endpoint: Endpoint, timeout: Duration) -> Self {
        Self { connector, endpoint, options: LinkOptions::rpc(timeout), timeout, socket: None }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Drop the socket; the next call reconnects.
    pub fn reset(&mut self) {
        if self.socket.take().is_some() {
            debug!(endpoint = %self.endpoint, "Video control socket reset");
        }
    }

    /// Send one command. `ok: false` replies become [`LinkError::Remote`].
    pub async fn call(&mut self, cmd: &str, args: Value) -> Result<RpcReply> {
        let reply = match self.exchange(cmd, args).await {
            Ok(reply) => reply,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        if reply.ok {
            Ok(reply)
        } else {
            let message = reply.error.unwrap_or_else(|| format!("{cmd} failed"));
            Err(LinkError::remote(message))
        }
    }

    async fn exchange(&mut self, cmd: &str, args: Value) -> Result<RpcReply> {
        let payload = serde_json::to_string(&RpcRequest { cmd, args })?;
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => {
                let fresh = self.connector.requester(&self.endpoint, &self.options).await?;
                self.socket.insert(fresh)
            }
        };

        trace!(cmd, "Video control request");
        let raw = tokio::time::timeout(self.timeout, socket.request(&payload))
            .await
            .map_err(|_| LinkError::timeout(format!("video rpc {cmd}"), self.timeout))??;
        serde_json::from_str(&raw).map_err(|e| LinkError::malformed("video rpc reply", e.to_string()))
    }

    fn data(reply: RpcReply) -> Value {
        reply.data.unwrap_or(Value::Null)
    }

    pub async fn ping(&mut self) -> Result<Value> {
        self.call("ping", json!({})).await.map(Self::data)
    }

    /// Start a stream, stopping a leftover stream of the same name first if the vehicle has one.
    pub async fn start_stream(&mut self, request: &StreamRequest) -> Result<StartReply> {
        let args = serde_json::to_value(request)?;
        let reply = match self.call("start_stream", args.clone()).await {
            Ok(reply) => reply,
            Err(e) if e.is_already_exists() => {
                info!(stream = %request.name, "Stream already running on vehicle, restarting it");
                if let Err(stop_err) = self.stop_stream(&request.name).await {
                    debug!(stream = %request.name, error = %stop_err, "Implicit stop failed");
                }
                self.call("start_stream", args).await?
            }
            Err(e) => return Err(e),
        };
        for notice in &reply.messages {
            warn!(stream = %request.name, %notice, "Vehicle reported recovery action");
        }
        Ok(StartReply { data: reply.data.unwrap_or(Value::Null), messages: reply.messages })
    }

    /// Stop a stream. A stream the vehicle does not know counts as stopped.
    pub async fn stop_stream(&mut self, name: &str) -> Result<Value> {
        match self.call("stop_stream", json!({ "name": name })).await {
            Ok(reply) => Ok(Self::data(reply)),
            Err(e) if e.is_not_found() => Ok(Value::Null),
            Err(e) => Err(e),
        }
    }

    pub async fn list_streams(&mut self) -> Result<Value> {
        self.call("list_streams", json!({})).await.map(Self::data)
    }

    pub async fn list_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let data = self.call("list_devices", json!({})).await.map(Self::data)?;
        serde_json::from_value(data).map_err(|e| LinkError::malformed("list_devices reply", e.to_string()))
    }

    pub async fn get_device_caps(&mut self, device: &str) -> Result<DeviceInfo> {
        let data = self.call("get_device_caps", json!({ "device": device })).await.map(Self::data)?;
        serde_json::from_value(data).map_err(|e| LinkError::malformed("get_device_caps reply", e.to_string()))
    }
}
