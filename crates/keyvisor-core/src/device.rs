// Keyvisor Device Handles
// Exclusive keyboard access through evdev, behind a trait seam

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use evdev::{Device, EventType};

use crate::event::{KeyAction, RawKeyEvent};

/// Errors raised while opening or reading a device node.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("cannot open device {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot grab device {path}: {source}")]
    Grab {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("read failed on {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("device {0} is not open")]
    NotOpen(PathBuf),
}

/// One keyboard endpoint as seen by the registry and the dispatch loop.
///
/// The registry only needs presence checks and open/close transitions; the
/// dispatch loop only needs the raw fd and event reads. Keeping the seam
/// here lets registry and daemon tests run against fake devices.
pub trait KeyDevice: Send {
    /// Path of the backing device node.
    fn path(&self) -> &Path;

    /// Whether the backing node currently exists on disk.
    fn node_present(&self) -> bool {
        self.path().exists()
    }

    fn is_open(&self) -> bool;

    /// Open (or re-open after a hot-unplug) the backing node.
    fn reopen(&mut self) -> Result<(), DeviceError>;

    /// Release the device handle. Safe to call when already closed.
    fn close(&mut self);

    /// Raw fd for the multi-device poll, when open.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Drain pending EV_KEY events. Non-key events are filtered out here.
    fn fetch_events(&mut self) -> Result<Vec<RawKeyEvent>, DeviceError>;
}

/// Real keyboard backed by an evdev character device.
///
/// The device is grabbed (EVIOCGRAB) while open, so keystrokes reach the
/// system only through the daemon's virtual output device.
pub struct EvdevKeyboard {
    path: PathBuf,
    device: Option<Device>,
}

impl EvdevKeyboard {
    /// Open and grab the device at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DeviceError> {
        let mut kbd = Self {
            path: path.into(),
            device: None,
        };
        kbd.reopen()?;
        Ok(kbd)
    }

    /// Device name as reported by the kernel, when open.
    pub fn name(&self) -> Option<&str> {
        self.device.as_ref().and_then(|d| d.name())
    }
}

impl KeyDevice for EvdevKeyboard {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn reopen(&mut self) -> Result<(), DeviceError> {
        if self.device.is_some() {
            return Ok(());
        }

        let mut device = Device::open(&self.path).map_err(|source| DeviceError::Open {
            path: self.path.clone(),
            source,
        })?;

        // A previous daemon instance may have crashed while holding the
        // grab; drop any stale one before taking ours.
        let _ = device.ungrab();
        device.grab().map_err(|source| DeviceError::Grab {
            path: self.path.clone(),
            source,
        })?;

        log::info!(
            "opened keyboard {} ({})",
            self.path.display(),
            device.name().unwrap_or("unnamed")
        );
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            let _ = device.ungrab();
            log::info!("closed keyboard {}", self.path.display());
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.device.as_ref().map(|d| d.as_raw_fd())
    }

    fn fetch_events(&mut self) -> Result<Vec<RawKeyEvent>, DeviceError> {
        let path = self.path.clone();
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| DeviceError::NotOpen(path.clone()))?;

        let mut events = Vec::new();
        let fetched = device
            .fetch_events()
            .map_err(|source| DeviceError::Read { path, source })?;
        for event in fetched {
            if event.event_type() != EventType::KEY {
                continue;
            }
            if let Some(action) = KeyAction::from_evdev_value(event.value()) {
                events.push(RawKeyEvent::new(event.code(), action));
            }
        }
        Ok(events)
    }
}

impl Drop for EvdevKeyboard {
    fn drop(&mut self) {
        // Devices must not stay grabbed past the daemon's lifetime.
        self.close();
    }
}
