// Keyvisor Passthrough Manager
// Reversible loading of key-code sets into the visibility table

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::visibility::{KeyVisibility, VisibilityTable, KEY_MAX};
use crate::watch::{WatchKind, WatchMessage};

/// Column that enumerates the passthrough key codes in a source file.
const KEY_CODES_COLUMN: &str = "key_codes";

/// Errors raised while parsing a passthrough source. A failed load leaves
/// the visibility table untouched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}: missing `{column}` column")]
    MissingColumn { path: PathBuf, column: String },

    #[error("{path}:{line}: invalid key code `{value}`")]
    InvalidKeyCode {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("{path} is empty")]
    Empty { path: PathBuf },
}

#[derive(Default)]
struct PassthroughState {
    /// Codes each loaded source contributed, for precise unloads.
    sources: HashMap<PathBuf, Vec<u16>>,
    /// Which sources currently claim each code. A code reverts to Show
    /// only when its claim set empties out.
    claims: HashMap<u16, HashSet<PathBuf>>,
}

/// Loads and unloads passthrough key sets. Every load is a reversible
/// transformation of the shared [`VisibilityTable`].
pub struct PassthroughManager {
    table: Arc<VisibilityTable>,
    state: Mutex<PassthroughState>,
}

impl PassthroughManager {
    pub fn new(table: Arc<VisibilityTable>) -> Self {
        Self {
            table,
            state: Mutex::new(PassthroughState::default()),
        }
    }

    /// Load passthrough codes from the csv file at `path` and mark them
    /// Hide. Re-loading a path unloads the previous set first, so edits
    /// apply atomically.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let codes = parse_key_codes(path)?;

        if self.state.lock().sources.contains_key(path) {
            self.unload(path);
        }

        let mut state = self.state.lock();
        for &code in &codes {
            state
                .claims
                .entry(code)
                .or_default()
                .insert(path.to_path_buf());
            self.table.set(code, KeyVisibility::Hide);
        }
        state.sources.insert(path.to_path_buf(), codes.clone());
        drop(state);

        log::info!("loaded {} passthrough keys from {}", codes.len(), path.display());
        Ok(())
    }

    /// Unload the codes previously recorded for `path`. Codes still
    /// claimed by another loaded source stay Hide. Unloading a path that
    /// was never loaded is a no-op.
    pub fn unload(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.state.lock();
        let Some(codes) = state.sources.remove(path) else {
            return;
        };

        for code in codes {
            let release = match state.claims.get_mut(&code) {
                Some(owners) => {
                    owners.remove(path);
                    owners.is_empty()
                }
                None => true,
            };
            if release {
                state.claims.remove(&code);
                self.table.set(code, KeyVisibility::Show);
            }
        }
        drop(state);

        log::info!("unloaded passthrough keys from {}", path.display());
    }

    /// React to a file-system notification from the keys directory with
    /// the same semantics as the direct calls.
    pub fn apply_fs_event(&self, msg: &WatchMessage) {
        match msg.kind {
            WatchKind::Create | WatchKind::Modify => match self.load(&msg.path) {
                Ok(()) => {}
                Err(ConfigError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    // The file vanished between the notification and the
                    // reload (renamed or deleted). A stale source must not
                    // keep its codes pinned at Hide.
                    self.unload(&msg.path);
                }
                Err(e) => log::error!("passthrough load failed: {}", e),
            },
            WatchKind::Remove => self.unload(&msg.path),
        }
    }

    /// Whether `path` is currently loaded.
    pub fn is_loaded(&self, path: &Path) -> bool {
        self.state.lock().sources.contains_key(path)
    }
}

/// Parse the `key_codes` column of a csv file. The whole file is parsed
/// before anything is applied: a malformed row aborts the load with no
/// partial table mutation.
fn parse_key_codes(path: &Path) -> Result<Vec<u16>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = content.lines().enumerate();
    let (_, header) = lines.next().ok_or_else(|| ConfigError::Empty {
        path: path.to_path_buf(),
    })?;

    let column = header
        .split(',')
        .position(|name| name.trim() == KEY_CODES_COLUMN)
        .ok_or_else(|| ConfigError::MissingColumn {
            path: path.to_path_buf(),
            column: KEY_CODES_COLUMN.to_string(),
        })?;

    let mut codes = Vec::new();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let cell = line.split(',').nth(column).unwrap_or("").trim();
        let code: u16 = cell
            .parse()
            .ok()
            .filter(|&c| (c as usize) < KEY_MAX)
            .ok_or_else(|| ConfigError::InvalidKeyCode {
                path: path.to_path_buf(),
                line: idx + 1,
                value: cell.to_string(),
            })?;
        codes.push(code);
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn csv_source(rows: &[u16]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "key_name,key_codes").unwrap();
        for code in rows {
            writeln!(file, "K{code},{code}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn manager() -> (PassthroughManager, Arc<VisibilityTable>) {
        let table = Arc::new(VisibilityTable::new());
        (PassthroughManager::new(Arc::clone(&table)), table)
    }

    #[test]
    fn test_load_marks_codes_hide() {
        let (mgr, table) = manager();
        let src = csv_source(&[30, 31]);
        mgr.load(src.path()).unwrap();

        assert_eq!(table.get(30), KeyVisibility::Hide);
        assert_eq!(table.get(31), KeyVisibility::Hide);
        assert_eq!(table.get(32), KeyVisibility::Show);
        assert!(mgr.is_loaded(src.path()));
    }

    #[test]
    fn test_load_unload_round_trip() {
        let (mgr, table) = manager();
        let src = csv_source(&[30, 31]);
        mgr.load(src.path()).unwrap();
        mgr.unload(src.path());

        assert_eq!(table.get(30), KeyVisibility::Show);
        assert_eq!(table.get(31), KeyVisibility::Show);
        assert!(!mgr.is_loaded(src.path()));
    }

    #[test]
    fn test_shared_code_is_not_double_released() {
        let (mgr, table) = manager();
        let a = csv_source(&[30, 31]);
        let b = csv_source(&[31, 32]);
        mgr.load(a.path()).unwrap();
        mgr.load(b.path()).unwrap();

        mgr.unload(a.path());
        assert_eq!(table.get(30), KeyVisibility::Show);
        assert_eq!(table.get(31), KeyVisibility::Hide, "still claimed by b");
        assert_eq!(table.get(32), KeyVisibility::Hide);

        mgr.unload(b.path());
        assert_eq!(table.get(31), KeyVisibility::Show);
        assert_eq!(table.get(32), KeyVisibility::Show);
    }

    #[test]
    fn test_reload_replaces_previous_set() {
        let (mgr, table) = manager();
        let mut src = csv_source(&[30]);
        mgr.load(src.path()).unwrap();

        // Rewrite the file with a different code set and reload.
        src.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        src.as_file_mut().rewind().unwrap();
        writeln!(src, "key_name,key_codes").unwrap();
        writeln!(src, "B,48").unwrap();
        src.flush().unwrap();

        mgr.load(src.path()).unwrap();
        assert_eq!(table.get(30), KeyVisibility::Show);
        assert_eq!(table.get(48), KeyVisibility::Hide);
    }

    #[test]
    fn test_missing_column_aborts_without_mutation() {
        let (mgr, table) = manager();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "key_name,codes").unwrap();
        writeln!(file, "A,30").unwrap();
        file.flush().unwrap();

        let err = mgr.load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingColumn { .. }));
        assert_eq!(table.get(30), KeyVisibility::Show);
    }

    #[test]
    fn test_bad_code_aborts_whole_load() {
        let (mgr, table) = manager();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "key_name,key_codes").unwrap();
        writeln!(file, "A,30").unwrap();
        writeln!(file, "B,not-a-number").unwrap();
        file.flush().unwrap();

        let err = mgr.load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKeyCode { line: 3, .. }));
        // Row 30 parsed fine but must not have been applied.
        assert_eq!(table.get(30), KeyVisibility::Show);
    }

    #[test]
    fn test_out_of_range_code_rejected() {
        let (mgr, _table) = manager();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "key_codes").unwrap();
        writeln!(file, "9999").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            mgr.load(file.path()),
            Err(ConfigError::InvalidKeyCode { .. })
        ));
    }

    #[test]
    fn test_fs_events_mirror_direct_calls() {
        let (mgr, table) = manager();
        let src = csv_source(&[30]);

        mgr.apply_fs_event(&WatchMessage {
            path: src.path().to_path_buf(),
            kind: WatchKind::Create,
        });
        assert_eq!(table.get(30), KeyVisibility::Hide);

        mgr.apply_fs_event(&WatchMessage {
            path: src.path().to_path_buf(),
            kind: WatchKind::Remove,
        });
        assert_eq!(table.get(30), KeyVisibility::Show);
    }

    #[test]
    fn test_modify_event_on_vanished_source_unloads_it() {
        let (mgr, table) = manager();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("secrets.csv");
        std::fs::write(&src, "key_codes\n30\n").unwrap();
        mgr.load(&src).unwrap();
        assert_eq!(table.get(30), KeyVisibility::Hide);

        // The file is renamed away; the notification may still arrive as a
        // Modify. The stale source must unload rather than stay pinned.
        std::fs::rename(&src, dir.path().join("elsewhere")).unwrap();
        mgr.apply_fs_event(&WatchMessage {
            path: src.clone(),
            kind: WatchKind::Modify,
        });

        assert!(!mgr.is_loaded(&src));
        assert_eq!(table.get(30), KeyVisibility::Show);
    }

    #[test]
    fn test_unload_unknown_path_is_noop() {
        let (mgr, table) = manager();
        mgr.unload(Path::new("/nonexistent/keys.csv"));
        assert_eq!(table.get(30), KeyVisibility::Show);
    }
}
