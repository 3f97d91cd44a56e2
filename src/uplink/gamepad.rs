//! Gamepad input through `gilrs`.
//!
//! The `Gilrs` context is not `Send`, so it lives on a dedicated OS thread that
//! publishes the state of the selected pad on a watch channel. Devices handed
//! to the uplink only read that channel.

use super::input::{InputDevice, InputSource};
use crate::types::{Axes, Button, Buttons, Dpad, RawInput};
use crate::{DeviceErrorKind, LinkError, Result};
use gilrs::{Axis, Gilrs};
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(8);

#[derive(Debug, Clone, PartialEq)]
struct PadState {
    /// Increments every time a pad (re)appears at the selected index.
    generation: u64,
    name: String,
    input: RawInput,
}

/// Input source reading the `index`-th connected gamepad.
pub struct GamepadInput {
    state: watch::Receiver<Option<PadState>>,
}

impl GamepadInput {
    pub fn new(index: usize) -> Result<Self> {
        let (tx, rx) = watch::channel(None);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        thread::Builder::new()
            .name("rovlink-gamepad".into())
            .spawn(move || {
                let mut gilrs = match Gilrs::new() {
                    Ok(g) => {
                        let _ = ready_tx.send(Ok(()));
                        g
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                poll_gamepads(&mut gilrs, index, &tx);
                debug!("Gamepad thread exiting");
            })
            .map_err(|e| LinkError::device(DeviceErrorKind::NotFound, format!("cannot start gamepad thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { state: rx }),
            Ok(Err(reason)) => Err(LinkError::device(DeviceErrorKind::PermissionDenied, reason)),
            Err(_) => Err(LinkError::device(DeviceErrorKind::NotFound, "gamepad thread ended during startup")),
        }
    }
}

fn poll_gamepads(gilrs: &mut Gilrs, index: usize, tx: &watch::Sender<Option<PadState>>) {
    let mut generation = 0u64;
    let mut present = false;

    while !tx.is_closed() {
        while gilrs.next_event().is_some() {}

        let state = gilrs.gamepads().nth(index).map(|(_, pad)| {
            if !present {
                generation += 1;
                info!(name = pad.name(), index, "Gamepad attached");
            }
            let trigger = |button| pad.button_data(button).map(|d| f64::from(d.value())).unwrap_or(0.0);
            let input = RawInput {
                axes: Axes {
                    lx: f64::from(pad.value(Axis::LeftStickX)),
                    ly: f64::from(pad.value(Axis::LeftStickY)),
                    rx: f64::from(pad.value(Axis::RightStickX)),
                    ry: f64::from(pad.value(Axis::RightStickY)),
                    lt: trigger(gilrs::Button::LeftTrigger2),
                    rt: trigger(gilrs::Button::RightTrigger2),
                },
                buttons: map_buttons(|button| pad.is_pressed(button)),
                dpad: Dpad(
                    axis_from(pad.is_pressed(gilrs::Button::DPadLeft), pad.is_pressed(gilrs::Button::DPadRight)),
                    axis_from(pad.is_pressed(gilrs::Button::DPadDown), pad.is_pressed(gilrs::Button::DPadUp)),
                ),
            };
            PadState { generation, name: pad.name().to_string(), input }
        });

        if present && state.is_none() {
            warn!(index, "Gamepad detached");
        }
        present = state.is_some();
        tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });

        thread::sleep(POLL_INTERVAL);
    }
}

fn axis_from(negative: bool, positive: bool) -> i8 {
    i8::from(positive) - i8::from(negative)
}

fn map_buttons(is_pressed: impl Fn(gilrs::Button) -> bool) -> Buttons {
    let mut buttons = Buttons::default();
    for (ours, theirs) in [
        (Button::A, gilrs::Button::South),
        (Button::B, gilrs::Button::East),
        (Button::X, gilrs::Button::West),
        (Button::Y, gilrs::Button::North),
        (Button::Lb, gilrs::Button::LeftTrigger),
        (Button::Rb, gilrs::Button::RightTrigger),
        (Button::Win, gilrs::Button::Select),
        (Button::Menu, gilrs::Button::Start),
        (Button::Lstick, gilrs::Button::LeftThumb),
        (Button::Rstick, gilrs::Button::RightThumb),
    ] {
        buttons.set(ours, is_pressed(theirs));
    }
    buttons
}

struct GamepadDevice {
    name: String,
    generation: u64,
    state: watch::Receiver<Option<PadState>>,
}

impl GamepadDevice {
    fn current(&self) -> Result<RawInput> {
        match &*self.state.borrow() {
            Some(pad) if pad.generation == self.generation => Ok(pad.input),
            _ => Err(LinkError::device(DeviceErrorKind::Detached, format!("{} disconnected", self.name))),
        }
    }
}

impl InputDevice for GamepadDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_snapshot(&mut self) -> Result<RawInput> {
        self.current()
    }

    fn health_check(&mut self) -> Result<()> {
        self.current().map(|_| ())
    }
}

impl InputSource for GamepadInput {
    fn open(&self) -> Result<Box<dyn InputDevice>> {
        let current = self.state.borrow().clone();
        match current {
            Some(pad) => Ok(Box::new(GamepadDevice { name: pad.name, generation: pad.generation, state: self.state.clone() })),
            None => Err(LinkError::device(DeviceErrorKind::NotFound, "no gamepad connected")),
        }
    }
}
