//! Message transport seams.
//!
//! Each loop owns exactly one socket at a time and asks its connector for a
//! fresh one on every reconnect, so a half-open or timed-out socket is always
//! discarded rather than reused. The ZeroMQ implementation lives in [`zmq`];
//! tests plug in the in-memory doubles from `test_utils`.

use crate::{LinkError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod zmq;

pub use self::zmq::ZmqConnector;

/// Result of a non-blocking publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The outbound buffer was full; the message was discarded.
    Dropped,
}

/// Outbound half of a publish/subscribe link.
#[async_trait]
pub trait Publisher: Send {
    /// Publish without waiting for buffer space.
    async fn send(&mut self, payload: &str) -> Result<SendOutcome>;
}

/// Inbound half of a publish/subscribe link, subscribed to every topic.
#[async_trait]
pub trait Subscriber: Send {
    /// Wait for the next message.
    async fn recv(&mut self) -> Result<String>;

    /// Take a message if one is already buffered.
    async fn try_recv(&mut self) -> Result<Option<String>> {
        match self.recv().now_or_never() {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }
}

/// Request/reply socket. Callers discard it after any error.
#[async_trait]
pub trait Requester: Send {
    async fn request(&mut self, payload: &str) -> Result<String>;
}

#[async_trait]
pub trait PublisherConnector: Send + Sync {
    async fn publisher(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Publisher>>;
}

#[async_trait]
pub trait SubscriberConnector: Send + Sync {
    async fn subscriber(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Subscriber>>;
}

#[async_trait]
pub trait RequesterConnector: Send + Sync {
    async fn requester(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Requester>>;
}

/// Socket tuning for links that must survive the peer power-cycling.
///
/// Backends apply what they support and ignore the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub linger: Duration,
    pub send_hwm: Option<u32>,
    pub recv_hwm: Option<u32>,
    /// Keep only the newest unread message.
    pub conflate: bool,
    /// Bound on a single publish before it is reported as dropped.
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub reconnect_interval: Duration,
    pub reconnect_interval_max: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_ttl: Duration,
    pub tcp_keepalive: bool,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count: u32,
    pub tcp_nodelay: bool,
    /// IP type-of-service byte (DSCP << 2).
    pub tos: Option<u8>,
    /// Linux SO_PRIORITY.
    pub priority: Option<u8>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            linger: Duration::ZERO,
            send_hwm: None,
            recv_hwm: None,
            conflate: false,
            send_timeout: None,
            recv_timeout: None,
            reconnect_interval: Duration::from_millis(250),
            reconnect_interval_max: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            heartbeat_ttl: Duration::from_secs(6),
            tcp_keepalive: true,
            keepalive_idle: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            keepalive_count: 3,
            tcp_nodelay: true,
            tos: None,
            priority: None,
        }
    }
}

impl LinkOptions {
    /// Pilot command publisher: one-deep queue, expedited forwarding.
    pub fn control() -> Self {
        Self {
            send_hwm: Some(1),
            send_timeout: Some(Duration::from_millis(5)),
            tos: Some(0xB8),
            priority: Some(6),
            ..Self::default()
        }
    }

    /// Telemetry subscriber: newest message only.
    pub fn telemetry() -> Self {
        Self { recv_hwm: Some(1), conflate: true, tos: Some(0x88), priority: Some(5), ..Self::default() }
    }

    /// Video control requester with bounded send and receive.
    pub fn rpc(timeout: Duration) -> Self {
        Self { send_timeout: Some(timeout), recv_timeout: Some(timeout), ..Self::default() }
    }
}

/// A `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |why: &str| LinkError::config(format!("invalid endpoint '{text}': {why}"));
        let rest = text.trim().strip_prefix("tcp://").ok_or_else(|| invalid("expected tcp:// scheme"))?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
        Ok(Self::tcp(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
