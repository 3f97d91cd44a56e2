//! Operator input as sampled once per uplink tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The six continuous controller axes.
///
/// Sticks are in `[-1, 1]` with up and right positive; triggers are in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    pub lx: f64,
    pub ly: f64,
    pub rx: f64,
    pub ry: f64,
    pub lt: f64,
    pub rt: f64,
}

/// Named controller buttons, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    A,
    B,
    X,
    Y,
    Lb,
    Rb,
    Win,
    Menu,
    Lstick,
    Rstick,
}

impl Button {
    pub const ALL: [Button; 10] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::Lb,
        Button::Rb,
        Button::Win,
        Button::Menu,
        Button::Lstick,
        Button::Rstick,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Button::A => "a",
            Button::B => "b",
            Button::X => "x",
            Button::Y => "y",
            Button::Lb => "lb",
            Button::Rb => "rb",
            Button::Win => "win",
            Button::Menu => "menu",
            Button::Lstick => "lstick",
            Button::Rstick => "rstick",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Button {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Button::ALL
            .into_iter()
            .find(|button| button.as_str() == wanted)
            .ok_or_else(|| format!("unknown button '{s}'"))
    }
}

/// Pressed state of every button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buttons {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
    pub lb: bool,
    pub rb: bool,
    pub win: bool,
    pub menu: bool,
    pub lstick: bool,
    pub rstick: bool,
}

impl Buttons {
    pub fn get(&self, button: Button) -> bool {
        match button {
            Button::A => self.a,
            Button::B => self.b,
            Button::X => self.x,
            Button::Y => self.y,
            Button::Lb => self.lb,
            Button::Rb => self.rb,
            Button::Win => self.win,
            Button::Menu => self.menu,
            Button::Lstick => self.lstick,
            Button::Rstick => self.rstick,
        }
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        let slot = match button {
            Button::A => &mut self.a,
            Button::B => &mut self.b,
            Button::X => &mut self.x,
            Button::Y => &mut self.y,
            Button::Lb => &mut self.lb,
            Button::Rb => &mut self.rb,
            Button::Win => &mut self.win,
            Button::Menu => &mut self.menu,
            Button::Lstick => &mut self.lstick,
            Button::Rstick => &mut self.rstick,
        };
        *slot = pressed;
    }

    pub fn with(mut self, button: Button) -> Self {
        self.set(button, true);
        self
    }

    /// Edges from `previous` to `self`.
    pub fn edges_since(&self, previous: &Buttons) -> EdgeSet {
        let mut edges = EdgeSet::new();
        for button in Button::ALL {
            match (previous.get(button), self.get(button)) {
                (false, true) => {
                    edges.insert(button, Edge::Down);
                }
                (true, false) => {
                    edges.insert(button, Edge::Up);
                }
                _ => {}
            }
        }
        edges
    }
}

/// D-pad position as `(x, y)`, each in `{-1, 0, 1}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dpad(pub i8, pub i8);

/// Button transition between two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Down,
    Up,
}

/// Edges keyed by button, serialized as `{"y": "down"}`.
pub type EdgeSet = BTreeMap<Button, Edge>;

/// Unshaped sample read from an input device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawInput {
    pub axes: Axes,
    pub buttons: Buttons,
    pub dpad: Dpad,
}

/// Shaped sample plus the edges computed against the previous tick.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSnapshot {
    pub axes: Axes,
    pub buttons: Buttons,
    pub dpad: Dpad,
    pub edges: EdgeSet,
}

impl InputSnapshot {
    pub fn pressed(&self, button: Button) -> bool {
        self.edges.get(&button) == Some(&Edge::Down)
    }
}
