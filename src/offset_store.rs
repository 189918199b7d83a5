use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path_utils::FileIdentity;

/// Durable read position: identity of a file and offset into it where unread content begins
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadCursor {
    pub identity: FileIdentity,
    pub offset: u64,
}

/// Error type returned by a pre-save hook
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked right before each save
pub type UpdateHook = Box<dyn FnMut() -> Result<(), HookError>>;

const TEMP_PREFIX: &str = ".logtrack-";
const TEMP_SUFFIX: &str = ".tmp";

/// Whether `path` names a temporary file `OffsetStore::save` writes before renaming it over the sidecar
pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
}

/// Possible errors that could happen while working with persistent state storage
#[derive(Error, Debug)]
pub enum OffsetStoreError {
    #[error("while working with offset file")]
    IO(#[from] std::io::Error),

    #[error("offset file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("pre-save hook failed")]
    Hook(#[source] HookError),
}

/// Sidecar file holding a single `ReadCursor` as two lines of text: identity, then offset.
///
/// Missing or empty sidecar means there is no saved position yet. Anything else that does not parse is reported as
/// an error, because resuming from a guessed position would silently skip or repeat data.
pub struct OffsetStore {
    path: PathBuf,
    on_update: Option<UpdateHook>,
}

impl OffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            on_update: None,
        }
    }

    /// Register a callback executed right before every save. Its error aborts the save.
    pub fn with_update_hook(
        mut self,
        hook: impl FnMut() -> Result<(), HookError> + 'static,
    ) -> Self {
        self.on_update = Some(Box::new(hook));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ReadCursor>, OffsetStoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        parse_cursor(&content)
            .map(Some)
            .map_err(|reason| OffsetStoreError::Malformed {
                path: self.path.clone(),
                reason,
            })
    }

    /// Overwrite sidecar with `cursor`.
    ///
    /// New content is written into a temporary file in the same directory and renamed over the sidecar, so readers
    /// observe either the old record or the new one.
    pub fn save(&mut self, cursor: ReadCursor) -> Result<(), OffsetStoreError> {
        if let Some(hook) = self.on_update.as_mut() {
            hook().map_err(OffsetStoreError::Hook)?;
        }
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)?;
        write!(tmp, "{cursor}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        tracing::debug!(
            path = %self.path.display(),
            identity = cursor.identity,
            offset = cursor.offset,
            "saved read cursor"
        );
        Ok(())
    }
}

impl fmt::Debug for OffsetStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetStore")
            .field("path", &self.path)
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

impl fmt::Display for ReadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.identity)?;
        writeln!(f, "{}", self.offset)
    }
}

fn parse_cursor(content: &str) -> Result<ReadCursor, String> {
    let fields = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let [identity, offset] = fields.as_slice() else {
        return Err(format!("expected 2 fields, found {}", fields.len()));
    };
    let identity = identity
        .parse()
        .map_err(|e| format!("bad identity `{identity}`: {e}"))?;
    let offset = offset
        .parse()
        .map_err(|e| format!("bad offset `{offset}`: {e}"))?;
    Ok(ReadCursor { identity, offset })
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn dir() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn absent_sidecar_means_fresh_start(dir: TempDir) {
        let store = OffsetStore::new(dir.path().join("app.log.offset"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[rstest]
    #[case("")]
    #[case("\n\n")]
    fn empty_sidecar_means_fresh_start(dir: TempDir, #[case] content: &str) {
        let path = dir.path().join("app.log.offset");
        std::fs::write(&path, content).unwrap();
        assert_eq!(OffsetStore::new(path).load().unwrap(), None);
    }

    #[rstest]
    fn saved_cursor_is_loaded_back(dir: TempDir) {
        let path = dir.path().join("app.log.offset");
        let mut store = OffsetStore::new(&path);
        let cursor = ReadCursor {
            identity: 1234,
            offset: 56,
        };
        store.save(cursor).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1234\n56\n");
        assert_eq!(store.load().unwrap(), Some(cursor));
    }

    #[rstest]
    fn save_replaces_previous_record_and_leaves_no_temp_files(dir: TempDir) {
        let path = dir.path().join("app.log.offset");
        let mut store = OffsetStore::new(&path);
        store
            .save(ReadCursor {
                identity: 99999,
                offset: 123456,
            })
            .unwrap();
        store
            .save(ReadCursor {
                identity: 7,
                offset: 8,
            })
            .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7\n8\n");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[rstest]
    #[case("12\n")]
    #[case("12\n34\n56\n")]
    #[case("abc\n34\n")]
    #[case("12\n-3\n")]
    fn malformed_sidecar_is_an_error(dir: TempDir, #[case] content: &str) {
        let path = dir.path().join("app.log.offset");
        std::fs::write(&path, content).unwrap();
        let result = OffsetStore::new(path).load();
        assert!(matches!(result, Err(OffsetStoreError::Malformed { .. })));
    }

    #[rstest]
    fn hook_runs_before_every_save(dir: TempDir) {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut store = OffsetStore::new(dir.path().join("app.log.offset")).with_update_hook(
            move || {
                counter.set(counter.get() + 1);
                Ok(())
            },
        );
        store.save(ReadCursor::default()).unwrap();
        store.save(ReadCursor::default()).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[rstest]
    fn failing_hook_aborts_save(dir: TempDir) {
        let path = dir.path().join("app.log.offset");
        let mut store = OffsetStore::new(&path).with_update_hook(|| Err("sink is down".into()));
        let result = store.save(ReadCursor {
            identity: 1,
            offset: 2,
        });
        assert!(matches!(result, Err(OffsetStoreError::Hook(_))));
        assert!(!path.exists());
    }

    #[rstest]
    #[case(".logtrack-a1B2c3.tmp", true)]
    #[case("/var/log/.logtrack-x.tmp", true)]
    #[case("app.log.offset", false)]
    #[case("app.log.tmp", false)]
    fn temp_file_names_are_recognized(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_temp_file(Path::new(path)), expected);
    }
}
