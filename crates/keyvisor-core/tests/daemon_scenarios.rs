// End-to-end scenarios for the keyvisor daemon: hotplug lifecycle and
// passthrough isolation, driven through fake devices and recording sinks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use keyvisor_core::channel::ChannelError;
use keyvisor_core::output::OutputError;
use keyvisor_core::script::NullEngine;
use keyvisor_core::{
    DeviceError, DeviceRegistry, EventSink, KbdDaemon, KeyAction, KeyDevice, KeyOutput,
    KeyVisibility, RawKeyEvent, ScriptAdapter, Settings,
};

struct FakeKeyboard {
    path: PathBuf,
    plugged: Arc<AtomicBool>,
    open: bool,
}

impl FakeKeyboard {
    fn new(path: &str, plugged: Arc<AtomicBool>) -> Self {
        Self {
            path: PathBuf::from(path),
            plugged,
            open: true,
        }
    }
}

impl KeyDevice for FakeKeyboard {
    fn path(&self) -> &Path {
        &self.path
    }

    fn node_present(&self) -> bool {
        self.plugged.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn reopen(&mut self) -> Result<(), DeviceError> {
        if !self.node_present() {
            return Err(DeviceError::NotOpen(self.path.clone()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }

    fn fetch_events(&mut self) -> Result<Vec<RawKeyEvent>, DeviceError> {
        Ok(Vec::new())
    }
}

struct RecordingSink(Arc<Mutex<Vec<RawKeyEvent>>>);

impl EventSink for RecordingSink {
    fn send(&mut self, code: u16, action: KeyAction) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(RawKeyEvent::new(code, action));
        Ok(())
    }
}

struct RecordingOutput(Arc<Mutex<Vec<RawKeyEvent>>>);

impl KeyOutput for RecordingOutput {
    fn emit(&mut self, code: u16, action: KeyAction) -> Result<(), OutputError> {
        self.0.lock().unwrap().push(RawKeyEvent::new(code, action));
        Ok(())
    }
}

fn daemon_with_keys_dir(
    keys_dir: &Path,
) -> (
    KbdDaemon,
    Arc<Mutex<Vec<RawKeyEvent>>>,
    Arc<Mutex<Vec<RawKeyEvent>>>,
) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let echoed = Arc::new(Mutex::new(Vec::new()));
    let settings = Settings {
        keys_dir: keys_dir.to_path_buf(),
        ..Settings::default()
    };
    let daemon = KbdDaemon::new(
        settings,
        Box::new(RecordingSink(Arc::clone(&sent))),
        Box::new(RecordingOutput(Arc::clone(&echoed))),
        ScriptAdapter::new(Box::new(NullEngine)),
    );
    (daemon, sent, echoed)
}

fn type_key(daemon: &mut KbdDaemon, code: u16) {
    daemon
        .process_key(RawKeyEvent::new(code, KeyAction::Press))
        .unwrap();
    daemon
        .process_key(RawKeyEvent::new(code, KeyAction::Release))
        .unwrap();
}

#[test]
fn explicit_device_survives_unplug_replug_with_hotplug_disabled() {
    let registry = DeviceRegistry::new();
    let startup_plug = Arc::new(AtomicBool::new(true));
    let startup = registry.insert(
        Box::new(FakeKeyboard::new(
            "/dev/input/event3",
            Arc::clone(&startup_plug),
        )),
        true,
    );

    // Unplug: reconciliation moves the device to pulled.
    startup_plug.store(false, Ordering::SeqCst);
    registry.update_available(false);
    assert!(registry.is_pulled(startup));

    // A never-requested device plugged in during this window must stay
    // out while hotplug is disabled.
    let stray_plug = Arc::new(AtomicBool::new(true));
    let stray = registry.insert(
        Box::new(FakeKeyboard::new(
            "/dev/input/event9",
            Arc::clone(&stray_plug),
        )),
        false,
    );
    stray_plug.store(false, Ordering::SeqCst);
    registry.update_available(false);
    stray_plug.store(true, Ordering::SeqCst);
    registry.update_available(false);
    assert!(registry.is_pulled(stray));

    // Replug: the explicit device returns regardless of the policy.
    startup_plug.store(true, Ordering::SeqCst);
    registry.update_available(false);
    assert!(registry.is_available(startup));
    assert!(registry.is_pulled(stray));

    // With consent the stray device joins too.
    registry.update_available(true);
    assert!(registry.is_available(stray));
}

#[test]
fn passthrough_keys_are_echoed_and_never_reach_ipc() {
    let keys_dir = tempfile::tempdir().unwrap();
    let source = keys_dir.path().join("secrets.csv");
    std::fs::write(&source, "key_name,key_codes\nA,30\nB,31\n").unwrap();

    let (mut daemon, sent, echoed) = daemon_with_keys_dir(keys_dir.path());
    daemon.init_passthrough();
    assert!(daemon.passthrough().is_loaded(&source));

    type_key(&mut daemon, 30);
    type_key(&mut daemon, 32);

    let sent = sent.lock().unwrap();
    let echoed = echoed.lock().unwrap();
    assert!(sent.iter().all(|e| e.code == 32), "only code 32 may be shown");
    assert_eq!(sent.len(), 2);
    assert!(echoed.iter().all(|e| e.code == 30), "only code 30 is echoed");
    assert_eq!(echoed.len(), 2);
}

#[test]
fn no_hidden_code_ever_reaches_ipc_across_load_unload_cycles() {
    let keys_dir = tempfile::tempdir().unwrap();
    let a = keys_dir.path().join("a.csv");
    let b = keys_dir.path().join("b.csv");
    std::fs::write(&a, "key_codes\n30\n31\n").unwrap();
    std::fs::write(&b, "key_codes\n31\n").unwrap();

    let (mut daemon, sent, _echoed) = daemon_with_keys_dir(keys_dir.path());

    daemon.passthrough().load(&a).unwrap();
    daemon.passthrough().load(&b).unwrap();
    type_key(&mut daemon, 30);
    type_key(&mut daemon, 31);

    // Unloading `a` must not release 31, which `b` still claims.
    daemon.passthrough().unload(&a);
    type_key(&mut daemon, 30);
    type_key(&mut daemon, 31);

    daemon.passthrough().unload(&b);
    type_key(&mut daemon, 31);

    let sent = sent.lock().unwrap();
    // 30 became visible after unloading `a`; 31 only after unloading `b`.
    assert_eq!(
        sent.iter().map(|e| e.code).collect::<Vec<_>>(),
        vec![30, 30, 31, 31]
    );
}

#[test]
fn load_unload_round_trip_restores_table() {
    let keys_dir = tempfile::tempdir().unwrap();
    let source = keys_dir.path().join("keys.csv");
    std::fs::write(&source, "key_codes\n30\n31\n").unwrap();

    let (daemon, _sent, _echoed) = daemon_with_keys_dir(keys_dir.path());
    daemon.passthrough().load(&source).unwrap();
    assert_eq!(daemon.table().get(30), KeyVisibility::Hide);

    daemon.passthrough().unload(&source);
    assert_eq!(daemon.table().get(30), KeyVisibility::Show);
    assert_eq!(daemon.table().get(31), KeyVisibility::Show);
}

#[test]
fn malformed_source_in_keys_dir_does_not_block_others() {
    let keys_dir = tempfile::tempdir().unwrap();
    std::fs::write(keys_dir.path().join("bad.csv"), "no_codes_column\n30\n").unwrap();
    std::fs::write(keys_dir.path().join("good.csv"), "key_codes\n48\n").unwrap();

    let (daemon, _sent, _echoed) = daemon_with_keys_dir(keys_dir.path());
    daemon.init_passthrough();

    assert_eq!(daemon.table().get(48), KeyVisibility::Hide);
    assert_eq!(daemon.table().get(30), KeyVisibility::Show);
}
