// Keyvisor Core Library
// Privileged keyboard daemon: device registry, key classification, IPC

pub mod channel;
pub mod daemon;
pub mod device;
pub mod event;
pub mod ident;
pub mod output;
pub mod passthrough;
pub mod registry;
pub mod script;
pub mod settings;
pub mod visibility;
pub mod watch;

pub use channel::{ChannelError, ClassifiedEvent, EventSink, KbdChannel};
pub use daemon::{DaemonError, KbdDaemon};
pub use device::{DeviceError, EvdevKeyboard, KeyDevice};
pub use event::{KeyAction, RawKeyEvent};
pub use ident::by_id_is_keyboard;
pub use output::{KeyOutput, OutputError, VirtualKeyboard};
pub use passthrough::{ConfigError, PassthroughManager};
pub use registry::{DeviceId, DeviceRegistry};
pub use script::{NullEngine, Script, ScriptAdapter, ScriptEngine, ScriptError};
pub use settings::{Settings, SettingsError};
pub use visibility::{KeyVisibility, VisibilityTable, KEY_MAX};
pub use watch::{DirWatcher, WatchError, WatchKind, WatchMessage};
