//! ZeroMQ sockets over tokio.

use super::{
    Endpoint, LinkOptions, Publisher, PublisherConnector, Requester, RequesterConnector, SendOutcome,
    Subscriber, SubscriberConnector,
};
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

/// Creates ZeroMQ PUB, SUB and REQ sockets connected to an endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZmqConnector;

impl ZmqConnector {
    pub fn new() -> Self {
        Self
    }
}

fn log_unapplied(role: &'static str, endpoint: &Endpoint, options: &LinkOptions) {
    // The pure-Rust backend exposes no socket options; conflation is
    // emulated by the drain-latest receive loops.
    debug!(
        role,
        %endpoint,
        send_hwm = ?options.send_hwm,
        recv_hwm = ?options.recv_hwm,
        conflate = options.conflate,
        tos = ?options.tos,
        priority = ?options.priority,
        keepalive = options.tcp_keepalive,
        "Socket tuning options not supported by backend, using defaults"
    );
}

async fn connect_bounded<S: Socket>(socket: &mut S, endpoint: &Endpoint, limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, socket.connect(&endpoint.to_string()))
        .await
        .map_err(|_| LinkError::timeout(format!("connect {endpoint}"), limit))??;
    Ok(())
}

fn payload_text(message: ZmqMessage) -> Result<String> {
    let frame = message
        .into_vec()
        .pop()
        .ok_or_else(|| LinkError::malformed("zmq", "empty message"))?;
    String::from_utf8(frame.to_vec()).map_err(|e| LinkError::malformed("zmq", e.to_string()))
}

pub struct ZmqPublisher {
    socket: zeromq::PubSocket,
    send_timeout: Option<Duration>,
}

impl ZmqPublisher {
    /// Subscribers still attached to this socket.
    ///
    /// The backend neither reconnects nor reports a lost peer, and a send
    /// with no peers succeeds silently. Each attached peer runs a reader task
    /// holding one reference to the socket backend, so the reference count
    /// minus the socket's own and the one taken here is the peer count.
    pub fn live_peers(&self) -> usize {
        let backend = self.socket.backend();
        Arc::strong_count(&backend).saturating_sub(2)
    }
}

#[async_trait]
impl Publisher for ZmqPublisher {
    async fn send(&mut self, payload: &str) -> Result<SendOutcome> {
        if self.live_peers() == 0 {
            return Err(LinkError::transport("subscriber connection lost"));
        }
        let message = ZmqMessage::from(payload.to_string());
        match self.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.socket.send(message)).await {
                Ok(result) => result.map(|_| SendOutcome::Sent).map_err(LinkError::from),
                Err(_) => {
                    trace!("Publish did not complete within {:?}, dropped", limit);
                    Ok(SendOutcome::Dropped)
                }
            },
            None => {
                self.socket.send(message).await?;
                Ok(SendOutcome::Sent)
            }
        }
    }
}

pub struct ZmqSubscriber {
    socket: zeromq::SubSocket,
}

#[async_trait]
impl Subscriber for ZmqSubscriber {
    async fn recv(&mut self) -> Result<String> {
        let message = self.socket.recv().await?;
        payload_text(message)
    }
}

pub struct ZmqRequester {
    socket: zeromq::ReqSocket,
    send_timeout: Option<Duration>,
    recv_timeout: Option<Duration>,
}

#[async_trait]
impl Requester for ZmqRequester {
    async fn request(&mut self, payload: &str) -> Result<String> {
        let message = ZmqMessage::from(payload.to_string());
        match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.socket.send(message))
                .await
                .map_err(|_| LinkError::timeout("rpc send", limit))??,
            None => self.socket.send(message).await?,
        }
        let reply = match self.recv_timeout {
            Some(limit) => tokio::time::timeout(limit, self.socket.recv())
                .await
                .map_err(|_| LinkError::timeout("rpc receive", limit))??,
            None => self.socket.recv().await?,
        };
        payload_text(reply)
    }
}

#[async_trait]
impl PublisherConnector for ZmqConnector {
    async fn publisher(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Publisher>> {
        log_unapplied("pub", endpoint, options);
        let mut socket = zeromq::PubSocket::new();
        connect_bounded(&mut socket, endpoint, options.heartbeat_timeout).await?;
        debug!(%endpoint, "PUB connected");
        Ok(Box::new(ZmqPublisher { socket, send_timeout: options.send_timeout }))
    }
}

#[async_trait]
impl SubscriberConnector for ZmqConnector {
    async fn subscriber(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Subscriber>> {
        log_unapplied("sub", endpoint, options);
        let mut socket = zeromq::SubSocket::new();
        connect_bounded(&mut socket, endpoint, options.heartbeat_timeout).await?;
        socket.subscribe("").await?;
        debug!(%endpoint, "SUB connected");
        Ok(Box::new(ZmqSubscriber { socket }))
    }
}

#[async_trait]
impl RequesterConnector for ZmqConnector {
    async fn requester(&self, endpoint: &Endpoint, options: &LinkOptions) -> Result<Box<dyn Requester>> {
        let mut socket = zeromq::ReqSocket::new();
        let limit = options.send_timeout.unwrap_or(options.heartbeat_timeout);
        connect_bounded(&mut socket, endpoint, limit).await?;
        debug!(%endpoint, "REQ connected");
        Ok(Box::new(ZmqRequester {
            socket,
            send_timeout: options.send_timeout,
            recv_timeout: options.recv_timeout,
        }))
    }
}
