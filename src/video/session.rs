//! One video stream's connect/stall/retry state machine.
//!
//! ```text
//! waiting ──retry timer──▶ connecting ──first frame──▶ playing
//!    ▲                         │                           │
//!    └──── rpc/launch error ───┘                    no frames for
//!                                                   stall timeout
//! stalled ◀────────────────────────────────────────────────┘
//!    └──────── short delay ──▶ connecting
//! ```
//!
//! The session task owns the RPC socket and the receiver; a stall tears both
//! down locally and retries right away instead of waiting for the RPC layer
//! to notice the loss.

use super::catalog::StreamSpec;
use super::frame::{FrameReader, FrameSink, VideoFrame};
use super::receiver::{ReceiverLauncher, RunningReceiver};
use super::rpc::VideoControl;
use crate::config::{LinkConfig, VideoConfig};
use crate::driver::{StopOutcome, Worker};
use crate::transport::RequesterConnector;
use crate::Result;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Waiting,
    Connecting,
    Playing,
    Stalled,
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Waiting => "waiting",
            SessionState::Connecting => "connecting",
            SessionState::Playing => "playing",
            SessionState::Stalled => "stalled",
            SessionState::Released => "released",
        };
        f.write_str(text)
    }
}

/// What the console shows for a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Time since the newest frame of any run, filled in when read.
    pub age: Option<Duration>,
    pub last_error: Option<String>,
    /// Recovery notices reported by the vehicle on the latest start.
    pub notices: Vec<String>,
}

impl SessionStatus {
    fn waiting() -> Self {
        Self { state: SessionState::Waiting, age: None, last_error: None, notices: Vec::new() }
    }
}

/// Shared collaborators every session of a console uses.
pub struct VideoBackend<C: ?Sized> {
    pub connector: Arc<C>,
    pub launcher: Arc<dyn ReceiverLauncher>,
    /// Address the vehicle sends RTP to.
    pub receive_host: String,
}

impl<C: ?Sized> Clone for VideoBackend<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            launcher: Arc::clone(&self.launcher),
            receive_host: self.receive_host.clone(),
        }
    }
}

/// Handle to one stream's session task.
pub struct VideoSession {
    stream: StreamSpec,
    worker: Worker,
    status: watch::Receiver<SessionStatus>,
    status_tx: watch::Sender<SessionStatus>,
    frames: watch::Receiver<Option<VideoFrame>>,
    stop_timeout: Duration,
}

fn frame_age(frames: &watch::Receiver<Option<VideoFrame>>) -> Option<Duration> {
    frames.borrow().as_ref().map(|frame| frame.received_at.elapsed())
}

impl VideoSession {
    /// Start the session; the first connect attempt waits `start_delay`.
    pub fn spawn<C>(stream: StreamSpec, config: &LinkConfig, backend: VideoBackend<C>, start_delay: Duration) -> Self
    where
        C: RequesterConnector + ?Sized + 'static,
    {
        let (status_tx, status) = watch::channel(SessionStatus::waiting());
        let (frames_tx, frames) = watch::channel(None);
        let control =
            VideoControl::new(Arc::clone(&backend.connector), config.video_rpc_endpoint.clone(), config.video.rpc_timeout);

        let task = SessionTask {
            stream: stream.clone(),
            video: config.video.clone(),
            backend,
            control,
            status: status_tx.clone(),
            frames: frames_tx,
            epoch: 0,
        };
        debug!(stream = %stream.name, ?start_delay, "Spawning video session");
        let worker = Worker::spawn("video-session", move |cancel| task.run(cancel, start_delay));

        // Teardown sends a stop request and waits out the receiver grace period.
        let stop_timeout = config.stop_timeout + config.video.rpc_timeout + config.video.terminate_grace;
        Self { stream, worker, status, status_tx, frames, stop_timeout }
    }

    pub fn name(&self) -> &str {
        &self.stream.name
    }

    pub fn stream(&self) -> &StreamSpec {
        &self.stream
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.borrow().clone();
        status.age = frame_age(&self.frames);
        status
    }

    /// Current status, then every state, error or notice change.
    pub fn status_updates(&self) -> impl Stream<Item = SessionStatus> + 'static {
        let frames = self.frames.clone();
        WatchStream::new(self.status.clone()).map(move |mut status| {
            status.age = frame_age(&frames);
            status
        })
    }

    /// A reader with its own freshness cursor and the stream's channel order.
    pub fn frame_reader(&self) -> FrameReader {
        FrameReader::new(self.frames.clone(), self.stream.channel_order)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the receiver, ask the vehicle to stop sending, and release. Idempotent.
    pub async fn stop(&mut self) -> StopOutcome {
        let outcome = self.worker.stop(self.stop_timeout).await;
        self.status_tx.send_if_modified(|status| {
            let changed = status.state != SessionState::Released;
            status.state = SessionState::Released;
            changed
        });
        outcome
    }
}

struct SessionTask<C: ?Sized> {
    stream: StreamSpec,
    video: VideoConfig,
    backend: VideoBackend<C>,
    control: VideoControl<C>,
    status: watch::Sender<SessionStatus>,
    frames: watch::Sender<Option<VideoFrame>>,
    /// Receiver runs started so far; frames of older runs are ignored.
    epoch: u64,
}

impl<C> SessionTask<C>
where
    C: RequesterConnector + ?Sized + 'static,
{
    fn update(&self, apply: impl FnOnce(&mut SessionStatus)) {
        let mut transition = None;
        self.status.send_if_modified(|status| {
            let before = status.clone();
            apply(status);
            if status.state != before.state {
                transition = Some((before.state, status.state));
            }
            *status != before
        });
        if let Some((from, to)) = transition {
            info!(stream = %self.stream.name, %from, %to, "Video session state changed");
        }
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Arrival time of the newest frame from the current receiver run.
    fn last_frame(&self) -> Option<Instant> {
        self.frames
            .borrow()
            .as_ref()
            .filter(|frame| frame.id.epoch == self.epoch)
            .map(|frame| frame.received_at)
    }

    async fn run(mut self, cancel: CancellationToken, start_delay: Duration) {
        let mut backoff = self.video.retry_backoff.start();
        let mut next_attempt = Instant::now() + start_delay;
        let mut receiver: Option<Box<dyn RunningReceiver>> = None;
        let mut started_at = Instant::now();

        let mut ticker = tokio::time::interval(self.video.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();

            match self.state() {
                SessionState::Waiting | SessionState::Stalled => {
                    if now < next_attempt {
                        continue;
                    }
                    self.update(|status| status.state = SessionState::Connecting);
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.connect() => result,
                    };
                    match attempt {
                        Ok((running, notices)) => {
                            receiver = Some(running);
                            started_at = Instant::now();
                            backoff.reset();
                            let keep = notices.len().saturating_sub(self.video.max_notices);
                            self.update(|status| {
                                status.last_error = None;
                                status.notices = notices[keep..].to_vec();
                            });
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(stream = %self.stream.name, error = %e, ?delay, "Video stream not available, retrying");
                            self.control.reset();
                            next_attempt = Instant::now() + delay;
                            self.update(|status| {
                                status.state = SessionState::Waiting;
                                status.last_error = Some(e.to_string());
                            });
                        }
                    }
                }
                state @ (SessionState::Connecting | SessionState::Playing) => {
                    let last_frame = self.last_frame();
                    if state == SessionState::Connecting && last_frame.is_some() {
                        self.update(|status| status.state = SessionState::Playing);
                    }

                    let problem = match last_frame {
                        Some(at) if now.saturating_duration_since(at) > self.video.stall_timeout => {
                            Some(format!("no frames for {:.1}s", now.saturating_duration_since(at).as_secs_f64()))
                        }
                        None if now.saturating_duration_since(started_at) > self.video.first_frame_timeout => {
                            Some(format!("no first frame within {:.1}s", self.video.first_frame_timeout.as_secs_f64()))
                        }
                        _ if receiver.as_mut().is_some_and(|running| !running.is_alive()) => {
                            Some("receiver exited".to_string())
                        }
                        _ => None,
                    };

                    if let Some(reason) = problem {
                        warn!(stream = %self.stream.name, %reason, "Video stalled, reconnecting");
                        stop_receiver(&mut receiver, self.video.terminate_grace).await;
                        self.control.reset();
                        backoff.reset();
                        next_attempt = Instant::now() + self.video.stall_retry_delay;
                        self.update(|status| {
                            status.state = SessionState::Stalled;
                            status.last_error = Some(reason);
                        });
                    }
                }
                SessionState::Released => break,
            }
        }

        stop_receiver(&mut receiver, self.video.terminate_grace).await;
        if self.epoch > 0 {
            if let Err(e) = self.control.stop_stream(&self.stream.name).await {
                debug!(stream = %self.stream.name, error = %e, "Stop request on release failed");
            }
        }
        self.update(|status| status.state = SessionState::Released);
        debug!(stream = %self.stream.name, "Video session task exiting");
    }

    /// Ask the vehicle to send, then start the local receiver for a new run.
    async fn connect(&mut self) -> Result<(Box<dyn RunningReceiver>, Vec<String>)> {
        let request = self.stream.request(&self.backend.receive_host);
        let reply = self.control.start_stream(&request).await?;

        self.epoch += 1;
        let sink = FrameSink::new(self.frames.clone(), self.stream.geometry(), self.epoch);
        match self.backend.launcher.launch(&self.stream.receiver(), sink).await {
            Ok(running) => {
                info!(stream = %self.stream.name, epoch = self.epoch, port = self.stream.port, "Video receiver started");
                Ok((running, reply.messages))
            }
            Err(e) => {
                if let Err(stop_err) = self.control.stop_stream(&self.stream.name).await {
                    debug!(stream = %self.stream.name, error = %stop_err, "Stop after failed launch failed");
                }
                Err(e)
            }
        }
    }
}

async fn stop_receiver(receiver: &mut Option<Box<dyn RunningReceiver>>, grace: Duration) {
    if let Some(mut running) = receiver.take() {
        running.stop(grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryConnector, ScriptedLauncher};
    use crate::video::{ChannelOrder, VideoFormat};
    use serde_json::Value;

    fn stream() -> StreamSpec {
        StreamSpec {
            name: "front".into(),
            device: "/dev/video0".into(),
            width: 4,
            height: 2,
            fps: 30,
            video_format: VideoFormat::Mjpeg,
            port: 5000,
            latency_ms: 60,
            channel_order: ChannelOrder::Bgr,
            enabled: true,
        }
    }

    fn setup(reply: &'static str) -> (MemoryConnector, ScriptedLauncher, VideoBackend<MemoryConnector>) {
        let connector = MemoryConnector::new();
        connector.respond_with(move |_| Ok(reply.to_string()));
        let launcher = ScriptedLauncher::new();
        let backend = VideoBackend {
            connector: Arc::new(connector.clone()),
            launcher: Arc::new(launcher.clone()),
            receive_host: "10.0.0.1".into(),
        };
        (connector, launcher, backend)
    }

    fn commands(connector: &MemoryConnector) -> Vec<String> {
        connector
            .requests()
            .iter()
            .map(|raw| serde_json::from_str::<Value>(raw).unwrap()["cmd"].as_str().unwrap().to_string())
            .collect()
    }

    async fn at(start: Instant, millis: u64) {
        tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
    }

    fn config() -> LinkConfig {
        LinkConfig::for_host("127.0.0.1")
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn session_loop_can_run_on_any_worker_thread() {
        let (_, _, backend) = setup(r#"{"ok":true}"#);
        let config = config();
        let (status, _) = watch::channel(SessionStatus::waiting());
        let (frames, _) = watch::channel(None);
        let task = SessionTask {
            stream: stream(),
            video: config.video.clone(),
            control: VideoControl::new(
                Arc::clone(&backend.connector),
                config.video_rpc_endpoint.clone(),
                config.video.rpc_timeout,
            ),
            backend,
            status,
            frames,
            epoch: 0,
        };
        assert_send(&task.run(CancellationToken::new(), Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_moves_to_playing_with_notices() {
        let (connector, launcher, backend) = setup(r#"{"ok":true,"messages":["usb rebind","camera reset"]}"#);
        let start = Instant::now();
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);
        let mut reader = session.frame_reader();

        at(start, 100).await;
        assert_eq!(session.status().state, SessionState::Connecting);
        assert_eq!(launcher.launches(), 1);
        let sent: Value = serde_json::from_str(&connector.requests()[0]).unwrap();
        assert_eq!(sent["args"]["host"], "10.0.0.1");

        assert!(launcher.push_frame());
        at(start, 400).await;
        let status = session.status();
        assert_eq!(status.state, SessionState::Playing);
        assert_eq!(status.notices, ["usb rebind", "camera reset"]);
        assert!(status.age.is_some());

        assert_eq!(reader.read_frame().unwrap().data.len(), 4 * 2 * 3);
        assert!(reader.read_frame().is_none());

        assert_eq!(session.stop().await, StopOutcome::Joined);
        assert_eq!(session.status().state, SessionState::Released);
        assert_eq!(launcher.stops(), 1);
        assert_eq!(commands(&connector), ["start_stream", "stop_stream"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_tears_down_and_retries_quickly() {
        let (connector, launcher, backend) = setup(r#"{"ok":true}"#);
        let start = Instant::now();
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);

        at(start, 100).await;
        launcher.push_frame();
        at(start, 1000).await;
        assert_eq!(session.status().state, SessionState::Playing);

        // Last frame at 0.1 s, stall timeout 2 s, ticks every 250 ms.
        at(start, 2300).await;
        let status = session.status();
        assert_eq!(status.state, SessionState::Stalled);
        assert!(status.last_error.unwrap().contains("no frames"));
        assert_eq!(launcher.stops(), 1);

        at(start, 2600).await;
        assert_eq!(launcher.launches(), 2);
        assert_eq!(session.status().state, SessionState::Connecting);
        assert_eq!(commands(&connector), ["start_stream", "start_stream"]);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_exit_counts_as_stall() {
        let (_connector, launcher, backend) = setup(r#"{"ok":true}"#);
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        launcher.push_frame();
        tokio::time::sleep(Duration::from_millis(300)).await;

        launcher.kill_current();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = session.status();
        assert_eq!(status.state, SessionState::Stalled);
        assert_eq!(status.last_error.as_deref(), Some("receiver exited"));
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_first_frame_counts_as_stall() {
        let (_connector, launcher, backend) = setup(r#"{"ok":true}"#);
        let start = Instant::now();
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);

        at(start, 4900).await;
        assert_eq!(session.status().state, SessionState::Connecting);
        at(start, 5400).await;
        assert_eq!(session.status().state, SessionState::Stalled);
        at(start, 5600).await;
        assert_eq!(launcher.launches(), 2);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_failure_waits_with_growing_backoff() {
        let (connector, launcher, backend) = setup(r#"{"ok":false,"error":"camera missing"}"#);
        let start = Instant::now();
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);

        // Attempts at 0, 0.75 and 2.0 s; the next is not due before 3.69 s.
        at(start, 3000).await;
        assert_eq!(connector.requests().len(), 3);
        let status = session.status();
        assert_eq!(status.state, SessionState::Waiting);
        assert!(status.last_error.unwrap().contains("camera missing"));
        assert_eq!(launcher.launches(), 0);

        session.stop().await;
        assert_eq!(connector.requests().len(), 3, "nothing to stop on release");
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_stops_remote_stream() {
        let (connector, launcher, backend) = setup(r#"{"ok":true}"#);
        launcher.fail_next_launches(1);
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = session.status();
        assert_eq!(status.state, SessionState::Waiting);
        assert_eq!(commands(&connector), ["start_stream", "stop_stream"]);
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_delay_postpones_first_attempt() {
        let (connector, _launcher, backend) = setup(r#"{"ok":true}"#);
        let start = Instant::now();
        let mut session = VideoSession::spawn(stream(), &config(), backend, Duration::from_millis(1500));

        at(start, 1400).await;
        assert!(connector.requests().is_empty());
        at(start, 1600).await;
        assert_eq!(connector.requests().len(), 1);
        session.stop().await;
    }
}
