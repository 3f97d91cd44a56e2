//! Command uplink: operator input to a fixed-rate command stream.
//!
//! One task owns the input device and the publisher socket. Each tick it
//! samples the device, builds a [`CommandFrame`] and publishes it without
//! waiting for buffer space; a frame that cannot be sent is dropped and
//! counted. Device failures close the device and reopen it with backoff while
//! the tick cadence continues, and a lost publisher is recreated the same way.

mod input;
pub mod shaping;

#[cfg(feature = "gamepad")]
pub mod gamepad;

pub use input::{InputDevice, InputSource, NeutralInput};
pub use shaping::{FrameBuilder, ModeState, apply_deadzone};

use crate::backoff::BackoffPolicy;
use crate::config::{LinkConfig, UplinkConfig};
use crate::driver::{StopOutcome, Worker};
use crate::transport::{Endpoint, LinkOptions, Publisher, PublisherConnector, SendOutcome};
use crate::types::CommandFrame;
use futures::Stream;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the sent-frame observer channel.
const FRAME_OBSERVER_CAPACITY: usize = 256;

/// Controller connection state as shown to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum UplinkStatus {
    Connected { device: String, max_gain: f64 },
    Disconnected { reason: String },
    Stopped,
}

impl fmt::Display for UplinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UplinkStatus::Connected { device, .. } => write!(f, "Controller: OK ({device})"),
            UplinkStatus::Disconnected { reason } => write!(f, "Controller: - ({reason})"),
            UplinkStatus::Stopped => f.write_str("Controller: stopped"),
        }
    }
}

/// Counters since the uplink started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub reopen_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    reopen_count: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> UplinkStats {
        UplinkStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reopen_count: self.reopen_count.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running uplink task.
pub struct CommandUplink {
    worker: Worker,
    status: watch::Receiver<UplinkStatus>,
    status_tx: watch::Sender<UplinkStatus>,
    counters: Arc<Counters>,
    frames: Option<mpsc::Receiver<CommandFrame>>,
    stop_timeout: Duration,
}

impl CommandUplink {
    /// Start publishing to the configured control endpoint.
    pub fn spawn<C>(config: &LinkConfig, connector: Arc<C>, source: Arc<dyn InputSource>) -> Self
    where
        C: PublisherConnector + ?Sized + 'static,
    {
        let (status_tx, status) = watch::channel(UplinkStatus::Disconnected { reason: "starting".into() });
        let (frames_tx, frames) = mpsc::channel(FRAME_OBSERVER_CAPACITY);
        let counters = Arc::new(Counters::default());

        let task = UplinkTask {
            config: config.uplink.clone(),
            endpoint: config.control_endpoint.clone(),
            connector,
            source,
            status: status_tx.clone(),
            counters: Arc::clone(&counters),
            frames: frames_tx,
        };
        info!(endpoint = %config.control_endpoint, rate_hz = config.uplink.rate_hz, "Starting command uplink");
        let worker = Worker::spawn("command-uplink", move |cancel| task.run(cancel));

        Self { worker, status, status_tx, counters, frames: Some(frames), stop_timeout: config.stop_timeout }
    }

    pub fn status(&self) -> UplinkStatus {
        self.status.borrow().clone()
    }

    /// Current status, then every change.
    pub fn status_updates(&self) -> impl Stream<Item = UplinkStatus> + 'static {
        WatchStream::new(self.status.clone())
    }

    /// Frames that were handed to the transport, for logging and display.
    ///
    /// Can be taken once; frames are discarded when the receiver falls behind.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<CommandFrame>> {
        self.frames.take()
    }

    pub fn stats(&self) -> UplinkStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop publishing and release the device and socket. Idempotent.
    pub async fn stop(&mut self) -> StopOutcome {
        let outcome = self.worker.stop(self.stop_timeout).await;
        self.status_tx.send_if_modified(|status| replace_if_changed(status, UplinkStatus::Stopped));
        outcome
    }
}

fn replace_if_changed(slot: &mut UplinkStatus, next: UplinkStatus) -> bool {
    if *slot == next {
        false
    } else {
        *slot = next;
        true
    }
}

struct UplinkTask<C: ?Sized> {
    config: UplinkConfig,
    endpoint: Endpoint,
    connector: Arc<C>,
    source: Arc<dyn InputSource>,
    status: watch::Sender<UplinkStatus>,
    counters: Arc<Counters>,
    frames: mpsc::Sender<CommandFrame>,
}

impl<C> UplinkTask<C>
where
    C: PublisherConnector + ?Sized + 'static,
{
    fn set_status(&self, next: UplinkStatus) {
        let changed = self.status.send_if_modified(|status| replace_if_changed(status, next));
        if changed {
            match &*self.status.borrow() {
                UplinkStatus::Disconnected { reason } => warn!(%reason, "Controller disconnected"),
                other => info!("{}", other),
            }
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let options = LinkOptions::control();
        let mut publisher: Option<Box<dyn Publisher>> = None;
        let mut publish_backoff = BackoffPolicy::reconnect().start();
        let mut next_connect = Instant::now();

        let mut device: Option<Box<dyn InputDevice>> = None;
        let mut device_backoff = self.config.reopen_backoff.start();
        let mut next_open = Instant::now();
        let mut ever_opened = false;
        let mut last_health_check: Option<Instant> = None;

        let mut builder = FrameBuilder::new(&self.config);
        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();

            if publisher.is_none() && now >= next_connect {
                let attempt = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.connector.publisher(&self.endpoint, &options) => result,
                };
                match attempt {
                    Ok(socket) => {
                        info!(endpoint = %self.endpoint, "Command publisher connected");
                        publisher = Some(socket);
                        publish_backoff.reset();
                    }
                    Err(e) => {
                        let delay = publish_backoff.next_delay();
                        debug!(endpoint = %self.endpoint, error = %e, ?delay, "Command publisher connect failed");
                        next_connect = now + delay;
                    }
                }
            }

            if device.is_none() {
                if now < next_open {
                    continue;
                }
                match self.source.open() {
                    Ok(opened) => {
                        if ever_opened {
                            self.counters.reopen_count.fetch_add(1, Ordering::Relaxed);
                        }
                        ever_opened = true;
                        builder.reset_edges();
                        last_health_check = None;
                        device_backoff.reset();
                        self.set_status(UplinkStatus::Connected {
                            device: opened.name().to_string(),
                            max_gain: builder.modes().max_gain(),
                        });
                        device = Some(opened);
                    }
                    Err(e) => {
                        self.set_status(UplinkStatus::Disconnected { reason: e.to_string() });
                        next_open = now + device_backoff.next_delay();
                        continue;
                    }
                }
            }
            let Some(dev) = device.as_mut() else { continue };

            let due = last_health_check.is_none_or(|at| now.duration_since(at) >= self.config.health_check_period);
            let sample = if due {
                last_health_check = Some(now);
                dev.health_check().and_then(|_| dev.read_snapshot())
            } else {
                dev.read_snapshot()
            };
            let raw = match sample {
                Ok(raw) => raw,
                Err(e) => {
                    self.set_status(UplinkStatus::Disconnected { reason: e.to_string() });
                    device = None;
                    next_open = now + device_backoff.next_delay();
                    continue;
                }
            };

            let gain_before = builder.modes().max_gain();
            let frame = builder.tick(&raw, crate::epoch_seconds());
            if (builder.modes().max_gain() - gain_before).abs() > 1e-9 {
                self.set_status(UplinkStatus::Connected {
                    device: dev.name().to_string(),
                    max_gain: builder.modes().max_gain(),
                });
            }

            self.publish(&mut publisher, frame, &mut next_connect, &mut publish_backoff, now).await;
        }

        debug!("Command uplink loop exiting");
    }

    async fn publish(
        &self,
        publisher: &mut Option<Box<dyn Publisher>>,
        frame: CommandFrame,
        next_connect: &mut Instant,
        backoff: &mut crate::backoff::Backoff,
        now: Instant,
    ) {
        let Some(socket) = publisher.as_mut() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let payload = match frame.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode command frame");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match socket.send(&payload).await {
            Ok(SendOutcome::Sent) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!(seq = frame.seq, "Command frame sent");
                let _ = self.frames.try_send(frame);
            }
            Ok(SendOutcome::Dropped) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(seq = frame.seq, "Command frame dropped, outbound buffer full");
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %self.endpoint, error = %e, "Command publisher failed, reconnecting");
                *publisher = None;
                *next_connect = now + backoff.next_delay();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryConnector, ScriptedInput};
    use crate::types::{Axes, Button, RawInput};
    use futures::StreamExt;

    fn config() -> LinkConfig {
        let mut config = LinkConfig::for_host("127.0.0.1");
        config.uplink.rate_hz = 30.0;
        config.uplink.deadzone = 0.1;
        config
    }

    fn sent_frames(connector: &MemoryConnector) -> Vec<CommandFrame> {
        connector.published().iter().map(|p| CommandFrame::from_json(p).unwrap()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_shaped_frames_in_sequence() {
        let connector = Arc::new(MemoryConnector::new());
        let input = ScriptedInput::new("test pad");
        input.set_input(RawInput { axes: Axes { lx: 0.05, rx: 0.5, ..Axes::default() }, ..RawInput::default() });

        let mut uplink = CommandUplink::spawn(&config(), Arc::clone(&connector), Arc::new(input.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let frames = sent_frames(&connector);
        assert!(frames.len() >= 25, "expected ~30 frames, got {}", frames.len());
        assert!(frames.windows(2).all(|pair| pair[1].seq > pair[0].seq));
        assert_eq!(frames[0].axes.lx, 0.0);
        assert_eq!(frames[0].axes.rx, 0.5);
        assert_eq!(uplink.status(), UplinkStatus::Connected { device: "test pad".into(), max_gain: 1.0 });

        assert_eq!(uplink.stop().await, StopOutcome::Joined);
        assert_eq!(uplink.status(), UplinkStatus::Stopped);
        assert_eq!(uplink.stop().await, StopOutcome::AlreadyStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn modes_survive_dropped_frames() {
        let connector = Arc::new(MemoryConnector::new());
        let input = ScriptedInput::new("pad");
        let mut uplink = CommandUplink::spawn(&config(), Arc::clone(&connector), Arc::new(input.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        input.press(Button::Rstick);
        tokio::time::sleep(Duration::from_millis(50)).await;
        connector.drop_next_sends(3);
        input.release(Button::Rstick);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let frames = sent_frames(&connector);
        let toggled = frames.iter().position(|f| f.depth_hold() == Some(true)).expect("hold toggled");
        assert!(frames[toggled..].iter().all(|f| f.depth_hold() == Some(true)));
        assert!(uplink.stats().dropped >= 3);
        uplink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_detach_reopens_without_stopping() {
        let connector = Arc::new(MemoryConnector::new());
        let input = ScriptedInput::new("pad");
        let mut uplink = CommandUplink::spawn(&config(), Arc::clone(&connector), Arc::new(input.clone()));
        let mut statuses = uplink.status_updates();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(statuses.next().await, Some(UplinkStatus::Connected { .. })));

        input.unplug();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(uplink.status(), UplinkStatus::Disconnected { .. }));
        assert!(matches!(statuses.next().await, Some(UplinkStatus::Disconnected { .. })));

        input.plug();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(uplink.status(), UplinkStatus::Connected { .. }));
        assert_eq!(uplink.stats().reopen_count, 1);
        assert!(uplink.is_running());

        uplink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gain_change_reemits_connected() {
        let connector = Arc::new(MemoryConnector::new());
        let input = ScriptedInput::new("pad");
        let mut uplink = CommandUplink::spawn(&config(), Arc::clone(&connector), Arc::new(input.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        input.press(Button::A);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(uplink.status(), UplinkStatus::Connected { device: "pad".into(), max_gain: 0.95 });
        uplink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_reconnects_after_send_error() {
        let connector = Arc::new(MemoryConnector::new());
        connector.fail_next_connects(2);
        let mut uplink = CommandUplink::spawn(&config(), Arc::clone(&connector), Arc::new(NeutralInput));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.publisher_connects(), 1);

        connector.fail_next_sends(1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.publisher_connects(), 2);

        let mut frames = uplink.take_frames().unwrap();
        assert!(uplink.take_frames().is_none());
        assert!(frames.try_recv().is_ok());
        uplink.stop().await;
    }
}
