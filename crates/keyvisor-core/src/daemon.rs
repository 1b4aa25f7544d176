// Keyvisor Daemon
// The dispatch loop: read raw keystrokes, classify, route

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelError, EventSink};
use crate::device::DeviceError;
use crate::event::{KeyAction, RawKeyEvent};
use crate::ident::by_id_is_keyboard;
use crate::output::{KeyOutput, OutputError};
use crate::passthrough::{ConfigError, PassthroughManager};
use crate::registry::DeviceRegistry;
use crate::script::{ScriptAdapter, ScriptError};
use crate::settings::Settings;
use crate::visibility::{KeyVisibility, VisibilityTable};
use crate::watch::{DirWatcher, WatchKind, WatchMessage};

/// Errors that terminate or fail to start the daemon. Recoverable faults
/// (device vanish, script fault, malformed config source) are logged and
/// never surface here.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("poll failed: {0}")]
    Poll(std::io::Error),
}

/// The privileged half of the keyboard platform. Owns exclusive access to
/// the raw keyboards, classifies every keystroke through the visibility
/// table (with an optional script override), and routes it: Show to the
/// IPC sink, Keep to internal bookkeeping, Hide straight to the virtual
/// output device.
pub struct KbdDaemon {
    settings: Settings,
    registry: Arc<DeviceRegistry>,
    table: Arc<VisibilityTable>,
    passthrough: PassthroughManager,
    scripts: ScriptAdapter,
    sink: Box<dyn EventSink>,
    output: Box<dyn KeyOutput>,
    hotplug_watch: Option<DirWatcher>,
    keys_watch: Option<DirWatcher>,
    running: Arc<AtomicBool>,
    timeout: Duration,
    allow_hotplug: bool,
    /// Keys currently held among Keep-classified codes. This is the whole
    /// of KEEP's observable effect: it never leaves the process.
    held_keys: HashSet<u16>,
}

impl KbdDaemon {
    pub fn new(
        settings: Settings,
        sink: Box<dyn EventSink>,
        output: Box<dyn KeyOutput>,
        scripts: ScriptAdapter,
    ) -> Self {
        let table = Arc::new(VisibilityTable::new());
        let allow_hotplug = settings.allow_hotplug;
        let timeout = Duration::from_millis(settings.socket_timeout_ms);
        Self {
            settings,
            registry: Arc::new(DeviceRegistry::new()),
            passthrough: PassthroughManager::new(Arc::clone(&table)),
            table,
            scripts,
            sink,
            output,
            hotplug_watch: None,
            keys_watch: None,
            running: Arc::new(AtomicBool::new(true)),
            timeout,
            allow_hotplug,
            held_keys: HashSet::new(),
        }
    }

    /// Flag that makes `run` exit its wait and shut down when cleared.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<VisibilityTable> {
        &self.table
    }

    pub fn passthrough(&self) -> &PassthroughManager {
        &self.passthrough
    }

    /// Listen on a device the operator explicitly requested. The open
    /// failure is the caller's to see, not to be swallowed.
    pub fn add_device(&self, path: impl AsRef<Path>) -> Result<(), DaemonError> {
        self.registry.add_device(path)?;
        Ok(())
    }

    /// Allow or forbid unseen keyboards to join on hotplug. Explicit
    /// devices reconnect regardless.
    pub fn set_hotplug(&mut self, allow: bool) {
        self.allow_hotplug = allow;
    }

    /// Bound for the dispatch loop's multi-source wait.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Load a classification script, resolved against the scripts
    /// directory. These scripts are far more limited than the macro
    /// process's: they may only override a single event's visibility.
    pub fn load_script(&mut self, rel_path: impl AsRef<Path>) -> Result<(), DaemonError> {
        let path = self.settings.scripts_dir.join(rel_path);
        self.scripts.load(path)?;
        Ok(())
    }

    /// Load every passthrough csv already present in the keys directory.
    /// A malformed source is reported and skipped; it does not abort the
    /// others.
    pub fn init_passthrough(&self) {
        let entries = match std::fs::read_dir(&self.settings.keys_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "cannot read keys dir {}: {}",
                    self.settings.keys_dir.display(),
                    e
                );
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            if let Err(e) = self.passthrough.load(&path) {
                log::error!("skipping passthrough source: {}", e);
            }
        }
    }

    /// Reconcile which keyboards have become unavailable or available
    /// again.
    pub fn update_available_kbds(&self) {
        self.registry.update_available(self.allow_hotplug);
    }

    /// Classify one raw keystroke and route it. Only an exhausted IPC
    /// channel is fatal; everything else is handled in place.
    pub fn process_key(&mut self, event: RawKeyEvent) -> Result<(), DaemonError> {
        let table_decision = self.table.get(event.code);

        // A table-level Hide short-circuits before any script runs:
        // scripts must never observe keys the operator marked sensitive.
        if table_decision == KeyVisibility::Hide {
            self.echo(event);
            return Ok(());
        }

        let decision = self
            .scripts
            .classify(&event)
            .unwrap_or(table_decision);

        match decision {
            KeyVisibility::Show => match self.sink.send(event.code, event.action) {
                Ok(()) => {}
                Err(e @ ChannelError::Fatal { .. }) => return Err(e.into()),
                Err(e) => log::warn!("channel send failed: {e}"),
            },
            KeyVisibility::Keep => match event.action {
                KeyAction::Press => {
                    self.held_keys.insert(event.code);
                }
                KeyAction::Release => {
                    self.held_keys.remove(&event.code);
                }
                KeyAction::Repeat => {}
            },
            KeyVisibility::Hide => self.echo(event),
        }
        Ok(())
    }

    fn echo(&mut self, event: RawKeyEvent) {
        if let Err(e) = self.output.emit(event.code, event.action) {
            log::error!("virtual output write failed: {e}");
        }
    }

    /// Keep-classified keys currently held down.
    pub fn held_keys(&self) -> &HashSet<u16> {
        &self.held_keys
    }

    fn start_watchers(&mut self) {
        match DirWatcher::new(&self.settings.input_dir) {
            Ok(w) => self.hotplug_watch = Some(w),
            Err(e) => log::warn!("hotplug watch disabled: {e}"),
        }
        match DirWatcher::new(&self.settings.keys_dir) {
            Ok(w) => self.keys_watch = Some(w),
            Err(e) => log::warn!("passthrough watch disabled: {e}"),
        }
    }

    fn handle_hotplug(&self, msg: &WatchMessage) {
        let Some(name) = msg.path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        if !by_id_is_keyboard(name) {
            return;
        }

        if msg.kind == WatchKind::Create
            && self.allow_hotplug
            && !self.registry.knows_path(&msg.path)
        {
            match self.registry.add_hotplugged(&msg.path) {
                Ok(_) => log::info!("hotplugged keyboard {}", msg.path.display()),
                Err(e) => log::warn!("cannot open hotplugged device: {e}"),
            }
        }
        self.update_available_kbds();
    }

    /// Drain watcher notifications and apply them under the owning
    /// component's own locking discipline.
    fn drain_watchers(&mut self) {
        let hotplug: Vec<WatchMessage> = self
            .hotplug_watch
            .as_ref()
            .map(|w| w.drain())
            .unwrap_or_default();
        for msg in &hotplug {
            self.handle_hotplug(msg);
        }

        let keys: Vec<WatchMessage> = self
            .keys_watch
            .as_ref()
            .map(|w| w.drain())
            .unwrap_or_default();
        for msg in &keys {
            if msg.path.extension().and_then(|e| e.to_str()) == Some("csv") {
                self.passthrough.apply_fs_event(msg);
            }
        }
    }

    /// Start running the daemon. Returns when the running flag is cleared
    /// or the IPC channel dies for good.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        self.start_watchers();
        self.init_passthrough();

        let result = self.run_loop();

        // No detached work survives shutdown: watchers drop with their
        // threads, devices are ungrabbed and closed here.
        self.hotplug_watch = None;
        self.keys_watch = None;
        self.registry.close_all();
        result
    }

    /// Current poll bound. Read once per iteration so `set_timeout` takes
    /// effect on a running loop.
    fn poll_timeout_ms(&self) -> i32 {
        self.timeout.as_millis().min(i32::MAX as u128) as i32
    }

    fn run_loop(&mut self) -> Result<(), DaemonError> {
        while self.running.load(Ordering::SeqCst) {
            let timeout_ms = self.poll_timeout_ms();
            self.drain_watchers();

            let devices = self.registry.available_devices();
            let mut poll_fds: Vec<libc::pollfd> = Vec::with_capacity(devices.len());
            let mut polled = Vec::with_capacity(devices.len());
            for (id, device) in &devices {
                if let Some(fd) = device.lock().raw_fd() {
                    poll_fds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    polled.push((*id, Arc::clone(device)));
                }
            }

            if poll_fds.is_empty() {
                // Nothing to wait on; sleep briefly so reconciliation and
                // shutdown checks still happen.
                std::thread::sleep(Duration::from_millis(250));
                self.update_available_kbds();
                continue;
            }

            let ret = unsafe {
                libc::poll(
                    poll_fds.as_mut_ptr(),
                    poll_fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };

            if ret < 0 {
                let err = std::io::Error::last_os_error();
                // EINTR just means a signal arrived; the loop condition
                // checks the running flag.
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(DaemonError::Poll(err));
            }

            if ret == 0 {
                // Bounded wait expired: reconcile even absent keystrokes.
                self.update_available_kbds();
                continue;
            }

            for (i, (id, device)) in polled.iter().enumerate() {
                let revents = poll_fds[i].revents;
                if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
                    continue;
                }

                let fetched = device.lock().fetch_events();
                match fetched {
                    Ok(events) => {
                        for event in events {
                            self.process_key(event)?;
                        }
                    }
                    Err(e) => {
                        log::warn!("device read failed: {e}");
                        self.registry.mark_pulled(*id);
                        self.update_available_kbds();
                    }
                }
            }
        }
        Ok(())
    }
}
