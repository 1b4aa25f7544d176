// Keyvisor Virtual Output
// uinput keyboard that echoes passthrough keys to the system

use std::time::Duration;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};

use crate::event::KeyAction;

/// Default delay between synthesized events, in microseconds. Without a
/// gap some consumers collapse rapid repeats into one keystroke.
pub const DEFAULT_EVENT_DELAY_US: u64 = 3800;

/// Errors raised by the virtual output device.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("cannot create virtual keyboard: {0}")]
    Create(std::io::Error),

    #[error("cannot write event: {0}")]
    Write(std::io::Error),
}

/// Where Hide-classified keystrokes are echoed. Implemented by
/// [`VirtualKeyboard`]; tests substitute a recording sink.
pub trait KeyOutput: Send {
    fn emit(&mut self, code: u16, action: KeyAction) -> Result<(), OutputError>;
}

/// Synthetic keyboard backed by uinput. Downstream consumers see one
/// consistent keystroke stream regardless of which physical device a key
/// came from.
pub struct VirtualKeyboard {
    device: VirtualDevice,
    event_delay: Duration,
}

impl VirtualKeyboard {
    pub fn new() -> Result<Self, OutputError> {
        let mut keys = AttributeSet::new();
        for code in 0..crate::visibility::KEY_MAX as u16 {
            keys.insert(Key::new(code));
        }

        let device = VirtualDeviceBuilder::new()
            .map_err(OutputError::Create)?
            .name("Keyvisor (virtual) Keyboard")
            .with_keys(&keys)
            .map_err(OutputError::Create)?
            .build()
            .map_err(OutputError::Create)?;

        Ok(Self {
            device,
            event_delay: Duration::from_micros(DEFAULT_EVENT_DELAY_US),
        })
    }

    /// Set the delay between outputted events in microseconds.
    pub fn set_event_delay(&mut self, delay_us: u64) {
        self.event_delay = Duration::from_micros(delay_us);
    }
}

impl KeyOutput for VirtualKeyboard {
    fn emit(&mut self, code: u16, action: KeyAction) -> Result<(), OutputError> {
        let key_event = InputEvent::new(EventType::KEY, code, action.to_evdev_value());
        // SYN is required for the kernel to flush the key event.
        let syn_event = InputEvent::new(EventType::SYNCHRONIZATION, 0, 0);
        self.device
            .emit(&[key_event, syn_event])
            .map_err(OutputError::Write)?;

        if !self.event_delay.is_zero() {
            std::thread::sleep(self.event_delay);
        }
        Ok(())
    }
}
