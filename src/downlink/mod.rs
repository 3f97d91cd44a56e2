//! Telemetry downlink: a self-healing subscriber.
//!
//! The loop waits up to one poll interval for a message, then drains whatever
//! else is already buffered so the snapshot never lags behind the vehicle.
//! When the link goes quiet for longer than the stale timeout the socket is
//! discarded and recreated, at most once per timeout interval.

mod snapshot;

pub use snapshot::TelemetrySnapshot;

use crate::backoff::BackoffPolicy;
use crate::config::{DownlinkConfig, LinkConfig};
use crate::driver::{StopOutcome, Worker, sleep_or_cancel};
use crate::transport::{Endpoint, LinkOptions, Subscriber, SubscriberConnector};
use crate::types::TelemetryRecord;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every decoded telemetry record, in arrival order.
///
/// Called on the downlink task; must not block. Returning false counts the
/// record as dropped.
pub trait Dispatch: Send + 'static {
    fn dispatch(&mut self, record: &TelemetryRecord) -> bool;
}

impl Dispatch for mpsc::Sender<TelemetryRecord> {
    fn dispatch(&mut self, record: &TelemetryRecord) -> bool {
        self.try_send(record.clone()).is_ok()
    }
}

/// Discards every record.
impl Dispatch for () {
    fn dispatch(&mut self, _record: &TelemetryRecord) -> bool {
        true
    }
}

/// Adapter turning a closure into a [`Dispatch`].
pub struct DispatchFn<F>(pub F);

impl<F> Dispatch for DispatchFn<F>
where
    F: FnMut(&TelemetryRecord) + Send + 'static,
{
    fn dispatch(&mut self, record: &TelemetryRecord) -> bool {
        (self.0)(record);
        true
    }
}

/// Counters since the downlink started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownlinkStats {
    pub received: u64,
    pub malformed: u64,
    pub reconnects: u64,
    pub dispatch_dropped: u64,
    pub dispatch_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
    dispatch_dropped: AtomicU64,
    dispatch_panics: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DownlinkStats {
        DownlinkStats {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            dispatch_panics: self.dispatch_panics.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running downlink task.
pub struct TelemetryDownlink {
    worker: Worker,
    snapshot: watch::Receiver<TelemetrySnapshot>,
    counters: Arc<Counters>,
    stop_timeout: Duration,
}

impl TelemetryDownlink {
    /// Subscribe to the configured telemetry endpoint.
    pub fn spawn<C, D>(config: &LinkConfig, connector: Arc<C>, dispatch: D) -> Self
    where
        C: SubscriberConnector + ?Sized + 'static,
        D: Dispatch,
    {
        let (snapshot_tx, snapshot) = watch::channel(TelemetrySnapshot::default());
        let counters = Arc::new(Counters::default());
        let task = DownlinkTask {
            config: config.downlink.clone(),
            endpoint: config.telemetry_endpoint.clone(),
            connector,
            snapshot: snapshot_tx,
            counters: Arc::clone(&counters),
            dispatch,
        };
        info!(endpoint = %config.telemetry_endpoint, "Starting telemetry downlink");
        let worker = Worker::spawn("telemetry-downlink", move |cancel| task.run(cancel));

        Self { worker, snapshot, counters, stop_timeout: config.stop_timeout }
    }

    /// Copy of the current snapshot.
    pub fn latest(&self) -> TelemetrySnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn watch(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot.clone()
    }

    pub fn stats(&self) -> DownlinkStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop receiving and close the socket. Idempotent.
    pub async fn stop(&mut self) -> StopOutcome {
        self.worker.stop(self.stop_timeout).await
    }
}

struct DownlinkTask<C: ?Sized, D> {
    config: DownlinkConfig,
    endpoint: Endpoint,
    connector: Arc<C>,
    snapshot: watch::Sender<TelemetrySnapshot>,
    counters: Arc<Counters>,
    dispatch: D,
}

impl<C, D> DownlinkTask<C, D>
where
    C: SubscriberConnector + ?Sized + 'static,
    D: Dispatch,
{
    async fn run(mut self, cancel: CancellationToken) {
        let options = LinkOptions::telemetry();
        let mut socket: Option<Box<dyn Subscriber>> = None;
        let mut backoff = BackoffPolicy::reconnect().start();
        let mut last_rx: Option<Instant> = None;
        let mut connected_at = Instant::now();

        loop {
            let Some(subscriber) = socket.as_mut() else {
                let attempt = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.connector.subscriber(&self.endpoint, &options) => result,
                };
                match attempt {
                    Ok(fresh) => {
                        debug!(endpoint = %self.endpoint, "Telemetry subscriber connected");
                        socket = Some(fresh);
                        connected_at = Instant::now();
                        backoff.reset();
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        debug!(endpoint = %self.endpoint, error = %e, ?delay, "Telemetry subscriber connect failed");
                        if !sleep_or_cancel(&cancel, delay).await {
                            break;
                        }
                    }
                }
                continue;
            };

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.poll_interval, subscriber.recv()) => result,
            };

            let failure = match polled {
                Ok(Ok(raw)) => {
                    let now = Instant::now();
                    last_rx = Some(now);
                    self.handle(&raw, now);
                    self.drain(&mut **subscriber, &mut last_rx).await.err()
                }
                Ok(Err(e)) => Some(e),
                Err(_elapsed) => {
                    let now = Instant::now();
                    let (quiet_since, limit) = match last_rx {
                        Some(rx) => (rx.max(connected_at), self.config.stale_reconnect_timeout),
                        None => (connected_at, self.config.initial_timeout),
                    };
                    let quiet = now.duration_since(quiet_since);
                    if quiet > limit {
                        info!(endpoint = %self.endpoint, ?quiet, "Telemetry quiet, recreating subscriber");
                        socket = None;
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        if !sleep_or_cancel(&cancel, self.config.reset_pause).await {
                            break;
                        }
                    }
                    None
                }
            };

            if let Some(e) = failure {
                warn!(endpoint = %self.endpoint, error = %e, "Telemetry subscriber failed, reconnecting");
                socket = None;
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                if !sleep_or_cancel(&cancel, self.config.reset_pause).await {
                    break;
                }
            }
        }

        debug!("Telemetry downlink loop exiting");
    }

    /// Consume everything already buffered.
    async fn drain(&mut self, subscriber: &mut dyn Subscriber, last_rx: &mut Option<Instant>) -> crate::Result<()> {
        while let Some(raw) = subscriber.try_recv().await? {
            let now = Instant::now();
            *last_rx = Some(now);
            self.handle(&raw, now);
        }
        Ok(())
    }

    fn handle(&mut self, raw: &str, at: Instant) {
        let record = match TelemetryRecord::parse(raw) {
            Ok(record) => record,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Skipping malformed telemetry");
                return;
            }
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let dispatch = &mut self.dispatch;
        match catch_unwind(AssertUnwindSafe(|| dispatch.dispatch(&record))) {
            Ok(true) => {}
            Ok(false) => {
                self.counters.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.dispatch_panics.fetch_add(1, Ordering::Relaxed);
                warn!(tag = %record.tag, "Telemetry handler panicked");
            }
        }

        self.snapshot.send_modify(|snapshot| snapshot.apply(record, at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryConnector;
    use crate::types::TelemetryTag;

    fn config() -> LinkConfig {
        LinkConfig::for_host("127.0.0.1")
    }

    async fn at(offset: Duration, start: Instant) {
        tokio::time::sleep_until(start + offset).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_in_order_and_skips_malformed() {
        let connector = Arc::new(MemoryConnector::new());
        let (tx, mut rx) = mpsc::channel(16);
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(connector.inject(r#"{"type":"heartbeat","armed":true,"pilot_age":0.05}"#));
        assert!(connector.inject("not json"));
        assert!(connector.inject(r#"{"sensor":"power","voltage_v":15.9}"#));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rx.recv().await.unwrap().tag, TelemetryTag::Heartbeat);
        assert_eq!(rx.recv().await.unwrap().tag, TelemetryTag::Power);
        let stats = downlink.stats();
        assert_eq!((stats.received, stats.malformed, stats.reconnects), (2, 1, 0));
        assert!(downlink.latest().heartbeat().unwrap().armed);

        assert_eq!(downlink.stop().await, StopOutcome::Joined);
        assert!(!downlink.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn oddly_typed_messages_still_refresh_state() {
        let connector = Arc::new(MemoryConnector::new());
        let (tx, mut rx) = mpsc::channel(16);
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(connector.inject(r#"{"type":"power","voltage_v":15.9,"current_a":2.5}"#));
        assert!(connector.inject(r#"{"type":"heartbeat","armed":1,"pilot_age":0.02}"#));
        assert!(connector.inject(r#"{"type":"power","error":{"code":3}}"#));
        assert!(connector.inject(r#"{"value":1}"#));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = downlink.latest();
        assert!(snapshot.heartbeat().unwrap().armed);
        assert!(snapshot.heartbeat_sample().last_activity.is_some());
        assert_eq!(crate::status::power_line(&snapshot), "Power: (ERR)");

        let tags: Vec<TelemetryTag> = std::iter::from_fn(|| rx.try_recv().ok()).map(|r| r.tag).collect();
        assert_eq!(tags.len(), 4);
        assert_eq!(tags[3], TelemetryTag::Other(crate::types::UNTAGGED.into()));
        assert_eq!(downlink.stats().malformed, 0);

        downlink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_link_is_recreated_once_per_interval() {
        let connector = Arc::new(MemoryConnector::new());
        let start = Instant::now();
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), ());
        at(Duration::from_millis(10), start).await;
        assert!(connector.inject(r#"{"type":"heartbeat"}"#));

        at(Duration::from_millis(2500), start).await;
        assert_eq!(connector.subscriber_connects(), 1);
        at(Duration::from_secs(4), start).await;
        assert_eq!(connector.subscriber_connects(), 2);
        at(Duration::from_millis(5500), start).await;
        assert_eq!(connector.subscriber_connects(), 2, "no reconnect storm");
        at(Duration::from_secs(7), start).await;
        assert_eq!(connector.subscriber_connects(), 3);
        assert_eq!(downlink.stats().reconnects, 2);

        downlink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_start_uses_initial_timeout() {
        let connector = Arc::new(MemoryConnector::new());
        let start = Instant::now();
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), ());

        at(Duration::from_millis(4500), start).await;
        assert_eq!(connector.subscriber_connects(), 1);
        at(Duration::from_millis(5500), start).await;
        assert_eq!(connector.subscriber_connects(), 2);

        downlink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_recreates_subscriber() {
        let connector = Arc::new(MemoryConnector::new());
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), ());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Taking over the memory subscriber breaks the downlink's socket.
        let _stolen = connector.subscriber(&Endpoint::tcp("x", 1), &LinkOptions::telemetry()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.subscriber_connects(), 3);
        assert_eq!(downlink.stats().reconnects, 1);

        assert!(connector.inject(r#"{"type":"power","voltage_v":16.0}"#));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(downlink.latest().get(&TelemetryTag::Power).is_some());
        downlink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_stop_loop() {
        let connector = Arc::new(MemoryConnector::new());
        let mut first = true;
        let handler = DispatchFn(move |_record: &TelemetryRecord| {
            if std::mem::take(&mut first) {
                panic!("handler bug");
            }
        });
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), handler);
        tokio::time::sleep(Duration::from_millis(10)).await;

        connector.inject(r#"{"type":"heartbeat"}"#);
        connector.inject(r#"{"type":"attitude"}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = downlink.stats();
        assert_eq!((stats.received, stats.dispatch_panics), (2, 1));
        assert!(downlink.latest().get(&TelemetryTag::Attitude).is_some());
        assert!(downlink.is_running());
        downlink.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_dispatch_channel_counts_drops() {
        let connector = Arc::new(MemoryConnector::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut downlink = TelemetryDownlink::spawn(&config(), Arc::clone(&connector), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..3 {
            connector.inject(r#"{"type":"heartbeat"}"#);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(downlink.stats().dispatch_dropped, 2);
        downlink.stop().await;
    }
}
