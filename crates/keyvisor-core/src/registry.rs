// Keyvisor Device Registry
// Owns every opened keyboard and partitions them into available/pulled

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{DeviceError, EvdevKeyboard, KeyDevice};

/// Stable identifier of a registry entry. Ids are arena indices and are
/// never reused or evicted while the daemon runs.
pub type DeviceId = usize;

/// Shared handle to one keyboard. The dispatch loop locks individual
/// devices for reads; the grouping locks below are never held across a
/// device lock acquisition of another grouping.
pub type SharedDevice = Arc<Mutex<Box<dyn KeyDevice>>>;

struct DeviceEntry {
    device: SharedDevice,
    /// Requested explicitly at startup. Explicit devices always reconnect
    /// on replug; unseen ones only when hotplugging is allowed.
    explicit: bool,
}

/// Registry of keyboards with three independently locked groupings:
/// `all` (owning arena), `available` (currently polled), `pulled`
/// (hot-unplugged, awaiting reattachment).
///
/// No method acquires two grouping locks at the same time; every move
/// releases one lock before taking the next.
pub struct DeviceRegistry {
    all: Mutex<Vec<DeviceEntry>>,
    available: Mutex<Vec<DeviceId>>,
    pulled: Mutex<Vec<DeviceId>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            all: Mutex::new(Vec::new()),
            available: Mutex::new(Vec::new()),
            pulled: Mutex::new(Vec::new()),
        }
    }

    /// Open the node at `path` as an explicitly requested keyboard and
    /// start listening on it. A failed open is reported to the caller: an
    /// explicit device request the operator made must not fail silently.
    pub fn add_device(&self, path: impl AsRef<Path>) -> Result<DeviceId, DeviceError> {
        let kbd = EvdevKeyboard::open(path.as_ref())?;
        Ok(self.insert(Box::new(kbd), true))
    }

    /// Open a hotplugged, not explicitly requested keyboard.
    pub fn add_hotplugged(&self, path: impl AsRef<Path>) -> Result<DeviceId, DeviceError> {
        let kbd = EvdevKeyboard::open(path.as_ref())?;
        Ok(self.insert(Box::new(kbd), false))
    }

    /// Insert an already-open device into the arena and the available set.
    pub fn insert(&self, device: Box<dyn KeyDevice>, explicit: bool) -> DeviceId {
        let id = {
            let mut all = self.all.lock();
            all.push(DeviceEntry {
                device: Arc::new(Mutex::new(device)),
                explicit,
            });
            all.len() - 1
        };
        self.available.lock().push(id);
        id
    }

    fn entry(&self, id: DeviceId) -> Option<(SharedDevice, bool)> {
        let all = self.all.lock();
        all.get(id).map(|e| (Arc::clone(&e.device), e.explicit))
    }

    /// Snapshot of the devices currently available for listening.
    pub fn available_devices(&self) -> Vec<(DeviceId, SharedDevice)> {
        let ids: Vec<DeviceId> = self.available.lock().clone();
        ids.into_iter()
            .filter_map(|id| self.entry(id).map(|(dev, _)| (id, dev)))
            .collect()
    }

    /// Whether any entry (available or pulled) is bound to `path`.
    pub fn knows_path(&self, path: &Path) -> bool {
        let all = self.all.lock();
        all.iter().any(|e| e.device.lock().path() == path)
    }

    pub fn is_available(&self, id: DeviceId) -> bool {
        self.available.lock().contains(&id)
    }

    pub fn is_pulled(&self, id: DeviceId) -> bool {
        self.pulled.lock().contains(&id)
    }

    pub fn device_count(&self) -> usize {
        self.all.lock().len()
    }

    /// Demote a device whose read failed. The node usually disappears a
    /// moment before inotify tells us about it.
    pub fn mark_pulled(&self, id: DeviceId) {
        let Some((device, _)) = self.entry(id) else {
            return;
        };
        {
            let mut available = self.available.lock();
            let Some(pos) = available.iter().position(|&i| i == id) else {
                return;
            };
            available.remove(pos);
        }
        let path = {
            let mut dev = device.lock();
            dev.close();
            dev.path().to_path_buf()
        };
        self.pulled.lock().push(id);
        log::warn!("keyboard {} pulled", path.display());
    }

    /// Reconcile `available` and `pulled` against on-disk reality.
    ///
    /// Available devices whose node vanished move to pulled. Pulled
    /// devices whose node reappeared reopen and move back, but only when
    /// they were explicitly requested or `allow_hotplug` is set.
    pub fn update_available(&self, allow_hotplug: bool) {
        let available_ids: Vec<DeviceId> = self.available.lock().clone();
        for id in available_ids {
            let Some((device, _)) = self.entry(id) else {
                continue;
            };
            if !device.lock().node_present() {
                self.mark_pulled(id);
            }
        }

        let pulled_ids: Vec<DeviceId> = self.pulled.lock().clone();
        for id in pulled_ids {
            let Some((device, explicit)) = self.entry(id) else {
                continue;
            };
            if !explicit && !allow_hotplug {
                continue;
            }

            let reopened = {
                let mut dev = device.lock();
                if !dev.node_present() {
                    continue;
                }
                match dev.reopen() {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("cannot reattach {}: {}", dev.path().display(), e);
                        false
                    }
                }
            };
            if !reopened {
                continue;
            }

            {
                let mut pulled = self.pulled.lock();
                if let Some(pos) = pulled.iter().position(|&i| i == id) {
                    pulled.remove(pos);
                }
            }
            self.available.lock().push(id);
        }
    }

    /// Close every device handle. Called once at shutdown.
    pub fn close_all(&self) {
        self.available.lock().clear();
        self.pulled.lock().clear();
        let all = self.all.lock();
        for entry in all.iter() {
            entry.device.lock().close();
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
