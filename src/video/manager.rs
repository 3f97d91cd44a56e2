//! Owns the sessions of every configured stream and tracks the displayed one.
//!
//! In warm mode every stream gets a session up front: the selected stream
//! first, the rest one at a time `warm_stagger` apart so the vehicle's
//! control plane never sees a burst of start requests. Switching the
//! displayed stream is then free. In single-active mode only the displayed
//! stream runs; a switch starts the new session before the old one is
//! released so the screen is never left without a stream being set up.

use super::catalog::{StreamCatalog, StreamSpec};
use super::session::{VideoBackend, VideoSession};
use crate::config::LinkConfig;
use crate::transport::RequesterConnector;
use crate::{LinkError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

pub struct StreamManager<C: ?Sized> {
    streams: Vec<StreamSpec>,
    config: LinkConfig,
    backend: VideoBackend<C>,
    warm: bool,
    sessions: HashMap<String, VideoSession>,
    selected: Option<usize>,
}

impl<C> StreamManager<C>
where
    C: RequesterConnector + ?Sized + 'static,
{
    /// Nothing runs until [`start`](Self::start).
    pub fn new(catalog: &StreamCatalog, config: LinkConfig, backend: VideoBackend<C>) -> Self {
        let warm = config.video.warm_keep;
        Self { streams: catalog.streams.clone(), config, backend, warm, sessions: HashMap::new(), selected: None }
    }

    pub fn is_warm(&self) -> bool {
        self.warm
    }

    /// Select the first stream and start sessions for the current mode.
    pub fn start(&mut self) {
        if self.streams.is_empty() {
            info!("No video streams configured");
            return;
        }
        let first = self.selected.unwrap_or(0);
        self.selected = Some(first);
        self.ensure_session(first, Duration::ZERO);

        if self.warm {
            let count = self.streams.len();
            for step in 1..count {
                let index = (first + step) % count;
                let delay = self.config.video.warm_stagger * u32::try_from(step).unwrap_or(u32::MAX);
                self.ensure_session(index, delay);
            }
        }
    }

    fn ensure_session(&mut self, index: usize, delay: Duration) {
        let Some(stream) = self.streams.get(index) else {
            return;
        };
        if self.sessions.contains_key(&stream.name) {
            return;
        }
        debug!(stream = %stream.name, ?delay, warm = self.warm, "Starting video session");
        let session = VideoSession::spawn(stream.clone(), &self.config, self.backend.clone(), delay);
        self.sessions.insert(stream.name.clone(), session);
    }

    /// Display `name`. Unknown names are a configuration error.
    pub async fn select(&mut self, name: &str) -> Result<()> {
        let index = self
            .streams
            .iter()
            .position(|stream| stream.name == name)
            .ok_or_else(|| LinkError::config(format!("unknown video stream '{name}'")))?;
        self.select_index(index).await;
        Ok(())
    }

    async fn select_index(&mut self, index: usize) {
        let previous = self.selected.replace(index);
        self.ensure_session(index, Duration::ZERO);

        if self.warm || previous == Some(index) {
            return;
        }
        let Some(old) = previous.and_then(|i| self.streams.get(i)).map(|stream| stream.name.clone()) else {
            return;
        };
        if let Some(mut session) = self.sessions.remove(&old) {
            info!(from = %old, to = %self.streams[index].name, "Switching video stream");
            session.stop().await;
        }
    }

    /// Display the following stream, wrapping around.
    pub async fn next(&mut self) {
        self.step(1).await;
    }

    /// Display the preceding stream, wrapping around.
    pub async fn prev(&mut self) {
        let back = self.streams.len().saturating_sub(1);
        self.step(back).await;
    }

    async fn step(&mut self, offset: usize) {
        let count = self.streams.len();
        if count == 0 {
            return;
        }
        let index = self.selected.map_or(0, |current| (current + offset) % count);
        self.select_index(index).await;
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.and_then(|i| self.streams.get(i)).map(|stream| stream.name.as_str())
    }

    /// Session of the displayed stream.
    pub fn active(&self) -> Option<&VideoSession> {
        self.selected().and_then(|name| self.sessions.get(name))
    }

    pub fn session(&self, name: &str) -> Option<&VideoSession> {
        self.sessions.get(name)
    }

    /// Configured stream names in catalog order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.streams.iter().map(|stream| stream.name.as_str())
    }

    /// Release every session. The selection is kept so `start` resumes it.
    pub async fn stop_all(&mut self) {
        for (name, mut session) in self.sessions.drain() {
            debug!(stream = %name, "Releasing video session");
            session.stop().await;
        }
    }
}
