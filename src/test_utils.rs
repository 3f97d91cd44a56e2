//! In-memory doubles for transports, input devices and the video receiver.
//!
//! These let the background loops run under `tokio::time::pause()` without
//! sockets, gamepads or GStreamer.

use crate::transport::{
    Endpoint, LinkOptions, Publisher, PublisherConnector, Requester, RequesterConnector, SendOutcome, Subscriber,
    SubscriberConnector,
};
use crate::types::{Button, RawInput};
use crate::uplink::{InputDevice, InputSource};
use crate::video::{FrameSink, ReceiverLauncher, ReceiverSpec, RunningReceiver};
use crate::{DeviceErrorKind, LinkError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Responder = Box<dyn FnMut(&str) -> Result<String> + Send>;

#[derive(Default)]
struct MemoryState {
    published: Vec<String>,
    drop_sends: usize,
    fail_sends: usize,
    fail_connects: usize,
    publisher_connects: usize,
    subscriber: Option<mpsc::UnboundedSender<String>>,
    subscriber_connects: usize,
    responder: Option<Responder>,
    requests: Vec<String>,
    requester_connects: usize,
}

/// Connector whose sockets are channels and vectors in memory.
///
/// Each new subscriber replaces the previous one; the replaced subscriber's
/// `recv` then fails like a reset socket.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything successfully published so far.
    pub fn published(&self) -> Vec<String> {
        lock(&self.state).published.clone()
    }

    /// Report the next `count` publishes as dropped.
    pub fn drop_next_sends(&self, count: usize) {
        lock(&self.state).drop_sends = count;
    }

    /// Fail the next `count` publishes with a transport error.
    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.state).fail_sends = count;
    }

    /// Refuse the next `count` connection attempts of any kind.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.state).fail_connects = count;
    }

    /// Deliver a payload to the current subscriber. Returns false if there is none.
    pub fn inject(&self, payload: impl Into<String>) -> bool {
        match &lock(&self.state).subscriber {
            Some(tx) => tx.send(payload.into()).is_ok(),
            None => false,
        }
    }

    /// Answer requests with `responder`.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Result<String> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }

    pub fn publisher_connects(&self) -> usize {
        lock(&self.state).publisher_connects
    }

    pub fn subscriber_connects(&self) -> usize {
        lock(&self.state).subscriber_connects
    }

    pub fn requester_connects(&self) -> usize {
        lock(&self.state).requester_connects
    }

    fn refuse_connect(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(LinkError::transport("connection refused"));
        }
        Ok(())
    }
}

struct MemoryPublisher {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn send(&mut self, payload: &str) -> Result<SendOutcome> {
        let mut state = lock(&self.state);
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(LinkError::transport("send failed"));
        }
        if state.drop_sends > 0 {
            state.drop_sends -= 1;
            return Ok(SendOutcome::Dropped);
        }
        state.published.push(payload.to_string());
        Ok(SendOutcome::Sent)
    }
}

struct MemorySubscriber {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn recv(&mut self) -> Result<String> {
        self.rx.recv().await.ok_or_else(|| LinkError::transport("subscriber replaced"))
    }
}

struct MemoryRequester {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Requester for MemoryRequester {
    async fn request(&mut self, payload: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.requests.push(payload.to_string());
        match state.responder.as_mut() {
            Some(responder) => responder(payload),
            None => Err(LinkError::timeout("rpc receive", std::time::Duration::from_secs(2))),
        }
    }
}

#[async_trait]
impl PublisherConnector for MemoryConnector {
    async fn publisher(&self, _endpoint: &Endpoint, _options: &LinkOptions) -> Result<Box<dyn Publisher>> {
        self.refuse_connect()?;
        lock(&self.state).publisher_connects += 1;
        Ok(Box::new(MemoryPublisher { state: Arc::clone(&self.state) }))
    }
}

#[async_trait]
impl SubscriberConnector for MemoryConnector {
    async fn subscriber(&self, _endpoint: &Endpoint, _options: &LinkOptions) -> Result<Box<dyn Subscriber>> {
        self.refuse_connect()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.subscriber = Some(tx);
        state.subscriber_connects += 1;
        Ok(Box::new(MemorySubscriber { rx }))
    }
}

#[async_trait]
impl RequesterConnector for MemoryConnector {
    async fn requester(&self, _endpoint: &Endpoint, _options: &LinkOptions) -> Result<Box<dyn Requester>> {
        self.refuse_connect()?;
        lock(&self.state).requester_connects += 1;
        Ok(Box::new(MemoryRequester { state: Arc::clone(&self.state) }))
    }
}

struct InputState {
    plugged: bool,
    generation: u64,
    input: RawInput,
    opens: usize,
}

/// Input source driven by the test: set the sample, press buttons, unplug.
#[derive(Clone)]
pub struct ScriptedInput {
    name: String,
    state: Arc<Mutex<InputState>>,
}

impl ScriptedInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(InputState {
                plugged: true,
                generation: 0,
                input: RawInput::default(),
                opens: 0,
            })),
        }
    }

    /// A source with no device attached.
    pub fn unplugged(name: impl Into<String>) -> Self {
        let source = Self::new(name);
        source.unplug();
        source
    }

    pub fn set_input(&self, input: RawInput) {
        lock(&self.state).input = input;
    }

    pub fn press(&self, button: Button) {
        lock(&self.state).input.buttons.set(button, true);
    }

    pub fn release(&self, button: Button) {
        lock(&self.state).input.buttons.set(button, false);
    }

    /// Detach the device; open handles start failing.
    pub fn unplug(&self) {
        let mut state = lock(&self.state);
        state.plugged = false;
        state.generation += 1;
    }

    pub fn plug(&self) {
        lock(&self.state).plugged = true;
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }
}

struct ScriptedDevice {
    name: String,
    generation: u64,
    state: Arc<Mutex<InputState>>,
}

impl ScriptedDevice {
    fn check(&self) -> Result<RawInput> {
        let state = lock(&self.state);
        if state.plugged && state.generation == self.generation {
            Ok(state.input)
        } else {
            Err(LinkError::device(DeviceErrorKind::Detached, format!("{} unplugged", self.name)))
        }
    }
}

impl InputDevice for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_snapshot(&mut self) -> Result<RawInput> {
        self.check()
    }

    fn health_check(&mut self) -> Result<()> {
        self.check().map(|_| ())
    }
}

impl InputSource for ScriptedInput {
    fn open(&self) -> Result<Box<dyn InputDevice>> {
        let mut state = lock(&self.state);
        if !state.plugged {
            return Err(LinkError::device(DeviceErrorKind::NotFound, "no controller"));
        }
        state.opens += 1;
        Ok(Box::new(ScriptedDevice {
            name: self.name.clone(),
            generation: state.generation,
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Default)]
struct LauncherState {
    specs: Vec<ReceiverSpec>,
    fail_launches: usize,
    /// Running receivers by launch generation.
    running: BTreeMap<u64, FrameSink>,
    generation: u64,
    stops: usize,
}

/// Receiver launcher whose "pipelines" emit frames only when told to.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` launches with a process error.
    pub fn fail_next_launches(&self, count: usize) {
        lock(&self.state).fail_launches = count;
    }

    /// Emit one blank frame from the newest running receiver. Returns false if none is running.
    pub fn push_frame(&self) -> bool {
        let mut state = lock(&self.state);
        match state.running.values_mut().next_back() {
            Some(sink) => {
                let len = sink.geometry().byte_len();
                sink.push(vec![0; len]);
                true
            }
            None => false,
        }
    }

    /// Make the newest running receiver exit as if the process died.
    pub fn kill_current(&self) {
        lock(&self.state).running.pop_last();
    }

    pub fn launches(&self) -> usize {
        lock(&self.state).specs.len()
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.state).running.is_empty()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.state).running.len()
    }

    /// Specs of every launch, in order.
    pub fn specs(&self) -> Vec<ReceiverSpec> {
        lock(&self.state).specs.clone()
    }
}

struct ScriptedReceiver {
    generation: u64,
    state: Arc<Mutex<LauncherState>>,
}

#[async_trait]
impl RunningReceiver for ScriptedReceiver {
    fn is_alive(&mut self) -> bool {
        lock(&self.state).running.contains_key(&self.generation)
    }

    async fn stop(&mut self, _grace: Duration) {
        let mut state = lock(&self.state);
        state.stops += 1;
        state.running.remove(&self.generation);
    }
}

#[async_trait]
impl ReceiverLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &ReceiverSpec, sink: FrameSink) -> Result<Box<dyn RunningReceiver>> {
        let mut state = lock(&self.state);
        if state.fail_launches > 0 {
            state.fail_launches -= 1;
            return Err(LinkError::process("scripted launch failure", None));
        }
        state.specs.push(spec.clone());
        state.generation += 1;
        let generation = state.generation;
        state.running.insert(generation, sink);
        Ok(Box::new(ScriptedReceiver { generation, state: Arc::clone(&self.state) }))
    }
}
