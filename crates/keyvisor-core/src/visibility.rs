// Keyvisor Visibility Table
// Per-key-code classification consulted on every keystroke

use std::sync::atomic::{AtomicU8, Ordering};

/// Routing decision for a key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVisibility {
    /// Forward the key to the unprivileged consumer over the IPC channel.
    Show,
    /// Keep the key inside this daemon for internal bookkeeping only.
    Keep,
    /// Echo the key straight to the virtual output device; scripts and the
    /// IPC channel never see it.
    Hide,
}

impl KeyVisibility {
    fn to_u8(self) -> u8 {
        match self {
            KeyVisibility::Show => 0,
            KeyVisibility::Keep => 1,
            KeyVisibility::Hide => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => KeyVisibility::Keep,
            2 => KeyVisibility::Hide,
            _ => KeyVisibility::Show,
        }
    }
}

/// Upper bound on evdev key codes (KEY_MAX + 1).
pub const KEY_MAX: usize = 0x2ff + 1;

/// Fixed-size classification table, one independently-atomic slot per key
/// code. There is no table-wide lock: slots are independent and the
/// dispatch path must never block behind a configuration mutation.
pub struct VisibilityTable {
    slots: Box<[AtomicU8]>,
}

impl VisibilityTable {
    /// Create a table with every code classified Show.
    pub fn new() -> Self {
        let slots = (0..KEY_MAX)
            .map(|_| AtomicU8::new(KeyVisibility::Show.to_u8()))
            .collect();
        Self { slots }
    }

    /// Classification for `code`. Out-of-range codes read as Show.
    pub fn get(&self, code: u16) -> KeyVisibility {
        match self.slots.get(code as usize) {
            Some(slot) => KeyVisibility::from_u8(slot.load(Ordering::Relaxed)),
            None => KeyVisibility::Show,
        }
    }

    /// Set the classification for `code`. Out-of-range codes are ignored.
    pub fn set(&self, code: u16, visibility: KeyVisibility) {
        if let Some(slot) = self.slots.get(code as usize) {
            slot.store(visibility.to_u8(), Ordering::Relaxed);
        }
    }

    /// Reset every slot to Show.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.store(KeyVisibility::Show.to_u8(), Ordering::Relaxed);
        }
    }
}

impl Default for VisibilityTable {
    fn default() -> Self {
        Self::new()
    }
}
