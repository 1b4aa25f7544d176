// Keyvisor Settings Module
// TOML-backed daemon configuration with CLI overrides on top

use std::path::{Path, PathBuf};

/// Runtime configuration for the daemon. Values come from a TOML file
/// (default: ~/.config/keyvisor/config.toml or /etc/keyvisor/config.toml)
/// and individual fields are overridden by CLI flags at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Socket of the unprivileged consumer process.
    pub socket: PathBuf,
    /// Directory of passthrough csv sources, watched for changes.
    pub keys_dir: PathBuf,
    /// Directory that script paths are resolved against.
    pub scripts_dir: PathBuf,
    /// Directory watched for device hotplug (by-id names).
    pub input_dir: PathBuf,
    /// Whether unseen keyboards may be added when plugged in.
    pub allow_hotplug: bool,
    /// Socket read/write timeout and dispatch-loop wait bound, in ms.
    pub socket_timeout_ms: u64,
    /// Delay between synthesized output events, in microseconds.
    pub event_delay_us: u64,
}

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

#[derive(Debug, Clone, serde::Deserialize, Default)]
struct SettingsToml {
    #[serde(default)]
    socket: Option<PathBuf>,
    #[serde(default)]
    keys_dir: Option<PathBuf>,
    #[serde(default)]
    scripts_dir: Option<PathBuf>,
    #[serde(default)]
    input_dir: Option<PathBuf>,
    #[serde(default)]
    allow_hotplug: Option<bool>,
    #[serde(default)]
    socket_timeout_ms: Option<u64>,
    #[serde(default)]
    event_delay_us: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/lib/keyvisor/kbd.sock"),
            keys_dir: PathBuf::from("/var/lib/keyvisor/keys"),
            scripts_dir: PathBuf::from("/var/lib/keyvisor/scripts"),
            input_dir: PathBuf::from("/dev/input/by-id"),
            allow_hotplug: true,
            socket_timeout_ms: 2048,
            event_delay_us: crate::output::DEFAULT_EVENT_DELAY_US,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    /// Load settings from a TOML string. Missing keys keep their defaults.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let parsed: SettingsToml =
            toml::from_str(content).map_err(|e| SettingsError::TomlParse(e.to_string()))?;

        let mut settings = Self::default();
        if let Some(socket) = parsed.socket {
            settings.socket = socket;
        }
        if let Some(keys_dir) = parsed.keys_dir {
            settings.keys_dir = keys_dir;
        }
        if let Some(scripts_dir) = parsed.scripts_dir {
            settings.scripts_dir = scripts_dir;
        }
        if let Some(input_dir) = parsed.input_dir {
            settings.input_dir = input_dir;
        }
        if let Some(allow_hotplug) = parsed.allow_hotplug {
            settings.allow_hotplug = allow_hotplug;
        }
        if let Some(timeout) = parsed.socket_timeout_ms {
            settings.socket_timeout_ms = timeout;
        }
        if let Some(delay) = parsed.event_delay_us {
            settings.event_delay_us = delay;
        }
        Ok(settings)
    }

    /// User-level settings path (~/.config/keyvisor/config.toml).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("keyvisor").join("config.toml"))
    }

    /// System-level settings path, used when no user file exists.
    pub fn system_path() -> PathBuf {
        PathBuf::from("/etc/keyvisor/config.toml")
    }

    /// Load from the default locations, falling back to built-in defaults
    /// when no file exists.
    pub fn load_default() -> Result<Self, SettingsError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::from_file(path);
            }
        }
        let system = Self::system_path();
        if system.exists() {
            return Self::from_file(system);
        }
        Ok(Self::default())
    }
}
