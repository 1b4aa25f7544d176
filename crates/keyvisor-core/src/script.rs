// Keyvisor Script Adapter
// Restricted per-device scripts that may override key classification

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::event::RawKeyEvent;
use crate::visibility::KeyVisibility;

/// Errors raised while compiling or running a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("cannot load script {path}: {reason}")]
    Compile { path: PathBuf, reason: String },

    #[error("script {path} failed: {reason}")]
    Runtime { path: PathBuf, reason: String },

    #[error("no script engine available for {0}")]
    NoEngine(PathBuf),
}

/// A compiled automation unit. Invoked per key event; `None` means the
/// script abstains and the visibility table's decision stands.
pub trait Script: Send {
    fn on_key(&mut self, event: &RawKeyEvent) -> Result<Option<KeyVisibility>, ScriptError>;
}

/// Compiles script sources into runnable [`Script`] instances. The
/// interpreter itself lives in a separate crate; this daemon only consumes
/// the seam.
pub trait ScriptEngine: Send {
    fn compile(&mut self, path: &Path) -> Result<Box<dyn Script>, ScriptError>;
}

/// Engine used when no interpreter is wired in: every load fails, which
/// degrades classification to table-only. The daemon must keep running
/// either way.
pub struct NullEngine;

impl ScriptEngine for NullEngine {
    fn compile(&mut self, path: &Path) -> Result<Box<dyn Script>, ScriptError> {
        Err(ScriptError::NoEngine(path.to_path_buf()))
    }
}

struct ScriptSlot {
    script: Box<dyn Script>,
    /// Set after the first runtime failure; the script stays loaded but is
    /// never invoked again this session.
    disabled: bool,
}

/// Path-keyed map of live scripts with at most one instance per path.
/// Ordered by path so that classification with several live scripts is
/// deterministic across runs.
///
/// A faulty script must never take the daemon down or widen what the
/// unprivileged side can observe, so failures disable the script and fall
/// back to the table's decision.
pub struct ScriptAdapter {
    engine: Box<dyn ScriptEngine>,
    scripts: BTreeMap<PathBuf, ScriptSlot>,
}

impl ScriptAdapter {
    pub fn new(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            scripts: BTreeMap::new(),
        }
    }

    /// Compile and register the script at `path`. Loading a path that is
    /// already live replaces the previous instance.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), ScriptError> {
        let path = path.as_ref();
        let script = self.engine.compile(path)?;
        self.scripts.insert(
            path.to_path_buf(),
            ScriptSlot {
                script,
                disabled: false,
            },
        );
        log::info!("loaded script {}", path.display());
        Ok(())
    }

    pub fn unload(&mut self, path: &Path) {
        self.scripts.remove(path);
    }

    pub fn loaded_count(&self) -> usize {
        self.scripts.len()
    }

    /// Offer `event` to the live scripts. The first concrete decision
    /// wins. A script error is reported once, disables that script, and
    /// never propagates into the dispatch path.
    pub fn classify(&mut self, event: &RawKeyEvent) -> Option<KeyVisibility> {
        for (path, slot) in self.scripts.iter_mut() {
            if slot.disabled {
                continue;
            }
            match slot.script.on_key(event) {
                Ok(Some(decision)) => return Some(decision),
                Ok(None) => {}
                Err(e) => {
                    log::error!("disabling script {}: {}", path.display(), e);
                    slot.disabled = true;
                }
            }
        }
        None
    }
}
