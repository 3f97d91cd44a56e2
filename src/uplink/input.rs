//! Local input device seam.
//!
//! Device capture and button mapping live behind these traits; the uplink only
//! needs a normalized [`RawInput`] per tick and a way to notice detachment.

use crate::Result;
use crate::types::RawInput;

/// An opened input device. Owned by the uplink task.
pub trait InputDevice: Send {
    /// Human-readable device name for status display.
    fn name(&self) -> &str;

    /// Sample the device. Stick Y axes are already inverted so up is positive.
    fn read_snapshot(&mut self) -> Result<RawInput>;

    /// Cheap liveness probe, called less often than `read_snapshot`.
    fn health_check(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens input devices. Each call re-enumerates, so hot-plugged devices are found.
pub trait InputSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn InputDevice>>;
}

/// Source whose device always reports centered sticks and no buttons.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralInput;

struct NeutralDevice;

impl InputDevice for NeutralDevice {
    fn name(&self) -> &str {
        "neutral"
    }

    fn read_snapshot(&mut self) -> Result<RawInput> {
        Ok(RawInput::default())
    }
}

impl InputSource for NeutralInput {
    fn open(&self) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(NeutralDevice))
    }
}
