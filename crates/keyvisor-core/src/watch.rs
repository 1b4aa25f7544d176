// Keyvisor Directory Watchers
// inotify-backed create/modify/remove notifications over a channel

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Errors raised while setting up a directory watch.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("cannot watch {path}: {source}")]
    Setup {
        path: PathBuf,
        source: notify::Error,
    },
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Create,
    Modify,
    Remove,
}

/// One notification, resolved to a concrete path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchMessage {
    pub path: PathBuf,
    pub kind: WatchKind,
}

/// Watches a single directory and forwards notifications over an mpsc
/// channel. The watcher callback never touches daemon state directly; the
/// dispatch loop drains [`DirWatcher::drain`] and applies mutations under
/// the owning component's own discipline.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchMessage>,
}

impl DirWatcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, WatchError> {
        let dir = dir.as_ref();
        let (tx, rx) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                for msg in translate(event) {
                    let _ = tx.send(msg);
                }
            },
            Config::default(),
        )
        .map_err(|source| WatchError::Setup {
            path: dir.to_path_buf(),
            source,
        })?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Setup {
                path: dir.to_path_buf(),
                source,
            })?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Collect all pending notifications without blocking.
    pub fn drain(&self) -> Vec<WatchMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

/// Resolve one notify event into per-path messages.
///
/// Renames arrive as `Modify(Name(..))`: a file moved out of the watched
/// directory must surface as Remove (its old path is gone), a file moved in
/// as Create. Treating them as plain Modify would leave consumers acting on
/// paths that no longer exist.
fn translate(event: Event) -> Vec<WatchMessage> {
    let per_path = |paths: Vec<PathBuf>, kind: WatchKind| -> Vec<WatchMessage> {
        paths
            .into_iter()
            .map(|path| WatchMessage { path, kind })
            .collect()
    };

    match event.kind {
        EventKind::Create(_) => per_path(event.paths, WatchKind::Create),
        EventKind::Remove(_) => per_path(event.paths, WatchKind::Remove),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            per_path(event.paths, WatchKind::Remove)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            per_path(event.paths, WatchKind::Create)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths[0] is the old name, paths[1] the new one.
            let mut paths = event.paths.into_iter();
            let mut msgs = Vec::new();
            if let Some(path) = paths.next() {
                msgs.push(WatchMessage {
                    path,
                    kind: WatchKind::Remove,
                });
            }
            if let Some(path) = paths.next() {
                msgs.push(WatchMessage {
                    path,
                    kind: WatchKind::Create,
                });
            }
            msgs
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Direction unknown; fall back to what is on disk now.
            event
                .paths
                .into_iter()
                .map(|path| {
                    let kind = if path.exists() {
                        WatchKind::Create
                    } else {
                        WatchKind::Remove
                    };
                    WatchMessage { path, kind }
                })
                .collect()
        }
        EventKind::Modify(_) => per_path(event.paths, WatchKind::Modify),
        _ => Vec::new(),
    }
}
