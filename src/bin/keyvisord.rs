// Keyvisor Daemon CLI
// Bootstrap for the privileged keyboard daemon

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use keyvisor_core::script::NullEngine;
use keyvisor_core::{KbdChannel, KbdDaemon, ScriptAdapter, Settings, VirtualKeyboard};

/// Privileged keyboard input daemon
#[derive(Parser, Debug)]
#[command(name = "keyvisord")]
#[command(about = "Privileged keyboard input daemon", long_about = None)]
struct Args {
    /// Keyboard device to listen on (can be used multiple times).
    /// Explicit devices always reconnect on hotplug.
    #[arg(short, long, value_name = "DEVICE")]
    device: Vec<PathBuf>,

    /// Never open keyboards that were not requested with --device
    #[arg(long)]
    no_hotplug: bool,

    /// Socket of the unprivileged macro process
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Directory of passthrough csv files
    #[arg(long, value_name = "DIR")]
    keys_dir: Option<PathBuf>,

    /// Directory that script paths resolve against
    #[arg(long, value_name = "DIR")]
    scripts_dir: Option<PathBuf>,

    /// Delay between outputted events in microseconds
    #[arg(long, value_name = "US")]
    event_delay: Option<u64>,

    /// Socket read/write timeout in milliseconds
    #[arg(long, value_name = "MS")]
    socket_timeout: Option<u64>,

    /// Scripts to load at startup, relative to the scripts directory
    #[arg(long, value_name = "SCRIPT")]
    script: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => Settings::load_default().context("cannot load default config")?,
    };

    // CLI flags win over the settings file.
    if args.no_hotplug {
        settings.allow_hotplug = false;
    }
    if let Some(socket) = &args.socket {
        settings.socket = socket.clone();
    }
    if let Some(keys_dir) = &args.keys_dir {
        settings.keys_dir = keys_dir.clone();
    }
    if let Some(scripts_dir) = &args.scripts_dir {
        settings.scripts_dir = scripts_dir.clone();
    }
    if let Some(delay) = args.event_delay {
        settings.event_delay_us = delay;
    }
    if let Some(timeout) = args.socket_timeout {
        settings.socket_timeout_ms = timeout;
    }
    Ok(settings)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let settings = load_settings(&args)?;
    let timeout = Duration::from_millis(settings.socket_timeout_ms);

    let channel = KbdChannel::connect(&settings.socket, timeout)
        .with_context(|| format!("cannot open IPC channel at {}", settings.socket.display()))?;

    let mut output = VirtualKeyboard::new().context("cannot create virtual keyboard")?;
    output.set_event_delay(settings.event_delay_us);

    let scripts = ScriptAdapter::new(Box::new(NullEngine));
    let mut daemon = KbdDaemon::new(settings, Box::new(channel), Box::new(output), scripts);

    for device in &args.device {
        daemon
            .add_device(device)
            .with_context(|| format!("cannot open device {}", device.display()))?;
    }
    for script in &args.script {
        if let Err(e) = daemon.load_script(script) {
            log::error!("cannot load script {}: {}", script.display(), e);
        }
    }

    // Graceful shutdown on SIGINT/SIGTERM: clear the running flag and let
    // the dispatch loop exit its bounded wait.
    let running = daemon.running_handle();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("cannot install signal handlers")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            log::info!("received signal, shutting down");
            running.store(false, Ordering::SeqCst);
        }
    });

    log::info!("keyvisord starting");
    daemon.run().context("daemon failed")?;
    log::info!("keyvisord stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "keyvisord",
            "--device",
            "/dev/input/event3",
            "--device",
            "/dev/input/event5",
            "--no-hotplug",
            "--event-delay",
            "1000",
        ]);
        assert_eq!(args.device.len(), 2);
        assert!(args.no_hotplug);
        assert_eq!(args.event_delay, Some(1000));
        assert!(args.socket.is_none());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let args = Args::parse_from([
            "keyvisord",
            "--no-hotplug",
            "--socket",
            "/tmp/kbd.sock",
            "--socket-timeout",
            "100",
        ]);
        // No config file given; defaults come from Settings::default or
        // the user's own config, both of which the flags must override.
        let settings = load_settings(&args).unwrap();
        assert!(!settings.allow_hotplug);
        assert_eq!(settings.socket, PathBuf::from("/tmp/kbd.sock"));
        assert_eq!(settings.socket_timeout_ms, 100);
    }
}
