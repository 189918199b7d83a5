use std::{
    collections::{BTreeMap, VecDeque},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

use crate::{offset_store::is_temp_file, TrackedReader, TrackedReaderError, TrackerOptions};

/// Possible errors that could happen while working with `DirectoryTracker`
#[derive(Error, Debug)]
pub enum DirectoryTrackerError {
    #[error("while listing watched directory")]
    IO(#[from] io::Error),
    #[error("invalid file name pattern")]
    InvalidPattern(#[from] glob::PatternError),
    #[error("while closing reader of {path}")]
    Close {
        path: PathBuf,
        #[source]
        source: TrackedReaderError,
    },
}

/// Structure that serves records of every matching file in a directory, one `TrackedReader` per file.
///
/// ## Usage
///
/// ```rust no_run
/// # use logtrack::{DirectoryTracker, DirectoryTrackerError, TrackerOptions};
/// let mut tracker = DirectoryTracker::new("/var/log/nginx", "*.log", TrackerOptions::default())?;
/// while let Some((path, record)) = tracker.next_record()? {
///     print!("{}: {}", path.display(), String::from_utf8_lossy(&record));
/// }
/// tracker.close()?;
/// # Ok::<(), DirectoryTrackerError>(())
/// ```
///
/// Files are visited in passes. Each pass lists the directory again, so files created in the meantime are picked up,
/// and takes at most one record from every tracked file. End of data is reported only after a whole pass found nothing.
///
/// Every file gets its own sidecar next to it, so `TrackerOptions::offset_file` is ignored. Sidecars and their
/// temporary files are never tracked. The name pattern should not match rotated names (eg. use `*.log` rather than
/// `*`), otherwise rotated files get tracked on their own.
///
/// A file whose reader cannot be created or fails to read is logged and skipped for the current pass, it is never
/// dropped from the set.
pub struct DirectoryTracker {
    dir: PathBuf,
    pattern: glob::Pattern,
    options: TrackerOptions,
    follow: Option<Duration>,
    readers: BTreeMap<PathBuf, TrackedReader>,
    /// files not yet visited in current pass
    pass: VecDeque<PathBuf>,
    productive: bool,
}

impl DirectoryTracker {
    pub fn new(
        dir: impl Into<PathBuf>,
        name_pattern: &str,
        options: TrackerOptions,
    ) -> Result<Self, DirectoryTrackerError> {
        let pattern = glob::Pattern::new(name_pattern)?;
        let follow = options.follow;
        let options = TrackerOptions {
            offset_file: None,
            follow: None,
            ..options
        };
        Ok(Self {
            dir: dir.into(),
            pattern,
            options,
            follow,
            readers: BTreeMap::new(),
            pass: VecDeque::new(),
            productive: false,
        })
    }

    /// Return next record together with path of the file it was read from
    pub fn next_record(&mut self) -> Result<Option<(PathBuf, Vec<u8>)>, DirectoryTrackerError> {
        let mut fresh_pass = false;
        loop {
            let Some(path) = self.pass.pop_front() else {
                if fresh_pass && !self.productive {
                    match self.follow {
                        Some(interval) => std::thread::sleep(interval),
                        None => return Ok(None),
                    }
                }
                self.start_pass()?;
                fresh_pass = true;
                continue;
            };
            let Some(reader) = self.readers.get_mut(&path) else {
                continue;
            };
            match reader.next_record() {
                Ok(Some(record)) => {
                    self.productive = true;
                    return Ok(Some((path, record)));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), "failed to read tracked file: {e}"),
            }
        }
    }

    /// List directory and start tracking files that are not tracked yet
    pub fn discover(&mut self) -> Result<(), DirectoryTrackerError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if self.readers.contains_key(&path) || !self.is_trackable(&path) {
                continue;
            }
            if !entry.file_type()?.is_file() {
                continue;
            }
            match TrackedReader::new(&path, self.options.clone()) {
                Ok(reader) => {
                    tracing::debug!(path = %path.display(), "tracking new file");
                    self.readers.insert(path, reader);
                }
                Err(e) => tracing::warn!(path = %path.display(), "cannot track file: {e}"),
            }
        }
        Ok(())
    }

    /// Paths of currently tracked files in visiting order
    pub fn tracked_files(&self) -> impl Iterator<Item = &Path> {
        self.readers.keys().map(PathBuf::as_path)
    }

    /// Close every reader saving its position. All readers are closed even if some fail, first error is returned.
    pub fn close(self) -> Result<(), DirectoryTrackerError> {
        let mut first_error = None;
        for (path, reader) in self.readers {
            match reader.close() {
                Err(source) if first_error.is_none() => {
                    first_error = Some(DirectoryTrackerError::Close { path, source });
                }
                Err(e) => tracing::warn!(path = %path.display(), "failed to close reader: {e}"),
                Ok(()) => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start_pass(&mut self) -> Result<(), DirectoryTrackerError> {
        self.discover()?;
        self.pass = self.readers.keys().cloned().collect();
        self.productive = false;
        Ok(())
    }

    fn is_trackable(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        let sidecar = name.ends_with(".offset");
        !sidecar && !is_temp_file(path) && self.pattern.matches(name)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), "a1\na2\n").unwrap();
        std::fs::write(dir.path().join("b.log"), "b1\nb2\n").unwrap();
        dir
    }

    fn drain(tracker: &mut DirectoryTracker) -> Vec<(String, String)> {
        let mut records = vec![];
        while let Some((path, record)) = tracker.next_record().unwrap() {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            records.push((name, String::from_utf8(record).unwrap()));
        }
        records
    }

    fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(name, record)| (name.to_string(), record.to_string()))
            .collect()
    }

    #[rstest]
    fn records_are_interleaved_between_files(dir: TempDir) {
        let mut tracker =
            DirectoryTracker::new(dir.path(), "*.log", TrackerOptions::default()).unwrap();
        assert_eq!(
            drain(&mut tracker),
            pairs(&[
                ("a.log", "a1\n"),
                ("b.log", "b1\n"),
                ("a.log", "a2\n"),
                ("b.log", "b2\n"),
            ])
        );
        assert_eq!(tracker.next_record().unwrap(), None);
    }

    #[rstest]
    fn new_files_are_discovered(dir: TempDir) {
        let mut tracker =
            DirectoryTracker::new(dir.path(), "*.log", TrackerOptions::default()).unwrap();
        drain(&mut tracker);

        std::fs::write(dir.path().join("c.log"), "c1\n").unwrap();
        File::options()
            .append(true)
            .open(dir.path().join("a.log"))
            .unwrap()
            .write_all(b"a3\n")
            .unwrap();
        assert_eq!(
            drain(&mut tracker),
            pairs(&[("a.log", "a3\n"), ("c.log", "c1\n")])
        );
    }

    #[rstest]
    fn sidecars_are_never_tracked(dir: TempDir) {
        let options = TrackerOptions {
            offset_file: Some(dir.path().join("shared.offset")),
            ..Default::default()
        };
        let mut tracker = DirectoryTracker::new(dir.path(), "*", options).unwrap();
        drain(&mut tracker);
        tracker.close().unwrap();

        assert!(!dir.path().join("shared.offset").exists());
        assert!(dir.path().join("a.log.offset").exists());
        assert!(dir.path().join("b.log.offset").exists());

        let mut tracker =
            DirectoryTracker::new(dir.path(), "*", TrackerOptions::default()).unwrap();
        assert!(drain(&mut tracker).is_empty());
        let tracked = tracker
            .tracked_files()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(tracked, vec!["a.log", "b.log"]);
    }

    #[rstest]
    fn positions_survive_restart(dir: TempDir) {
        let mut tracker =
            DirectoryTracker::new(dir.path(), "*.log", TrackerOptions::default()).unwrap();
        tracker.next_record().unwrap();
        tracker.close().unwrap();

        let mut tracker =
            DirectoryTracker::new(dir.path(), "*.log", TrackerOptions::default()).unwrap();
        assert_eq!(
            drain(&mut tracker),
            pairs(&[("a.log", "a2\n"), ("b.log", "b1\n"), ("b.log", "b2\n")])
        );
    }

    #[rstest]
    fn broken_file_does_not_block_others(dir: TempDir) {
        std::fs::write(dir.path().join("b.log.offset"), "garbage\n").unwrap();
        let mut tracker =
            DirectoryTracker::new(dir.path(), "*.log", TrackerOptions::default()).unwrap();
        assert_eq!(
            drain(&mut tracker),
            pairs(&[("a.log", "a1\n"), ("a.log", "a2\n")])
        );
    }

    #[test]
    fn invalid_name_pattern_is_rejected() {
        assert!(matches!(
            DirectoryTracker::new(".", "[", TrackerOptions::default()),
            Err(DirectoryTrackerError::InvalidPattern(_))
        ));
    }
}
