// Keyvisor Event Model
// Raw key events as read from evdev devices

/// Key transition carried by an evdev EV_KEY event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Press,
    Release,
    Repeat,
}

impl KeyAction {
    /// Convert an evdev event value (0/1/2) to a key action.
    pub fn from_evdev_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(KeyAction::Release),
            1 => Some(KeyAction::Press),
            2 => Some(KeyAction::Repeat),
            _ => None,
        }
    }

    /// Convert back to the evdev event value.
    pub fn to_evdev_value(self) -> i32 {
        match self {
            KeyAction::Release => 0,
            KeyAction::Press => 1,
            KeyAction::Repeat => 2,
        }
    }

    /// Wire byte used by the IPC channel.
    pub fn to_wire(self) -> u8 {
        self.to_evdev_value() as u8
    }

    /// Parse the wire byte used by the IPC channel.
    pub fn from_wire(byte: u8) -> Option<Self> {
        Self::from_evdev_value(byte as i32)
    }
}

/// A single key event read from a device, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    pub code: u16,
    pub action: KeyAction,
}

impl RawKeyEvent {
    pub fn new(code: u16, action: KeyAction) -> Self {
        Self { code, action }
    }
}
