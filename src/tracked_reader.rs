use std::{fs::Metadata, io, path::PathBuf};

use thiserror::Error;

use crate::{
    offset_store::{HookError, OffsetStore, OffsetStoreError, ReadCursor},
    options::{TrackerOptions, UnresolvedRotation},
    path_utils::{default_offset_path, identity_from_metadata, is_compressed, metadata_if_exists},
    rotation::{Anomaly, PatternError, RotationCandidate, RotationResolver},
    source::{Handle, OpenFile},
};

/// Possible errors that could happen while working with `TrackedReader`
#[derive(Error, Debug)]
pub enum TrackedReaderError {
    #[error("while working with underlying file")]
    IO(#[from] io::Error),
    #[error("while working with persistent state storage")]
    Persistence(#[from] OffsetStoreError),
    #[error("invalid rotation pattern")]
    Pattern(#[from] PatternError),
}

/// What the open handle points at
#[derive(Debug)]
enum Session {
    Normal,
    DrainingRotated(RotationCandidate),
}

/// Reader of newly appended lines of a file that survives restarts and log rotation.
///
/// ## Usage
///
/// ```rust no_run
/// # use logtrack::{TrackedReader, TrackedReaderError, TrackerOptions};
/// // every execution prints only lines appended since the previous one
/// let mut reader = TrackedReader::new("/var/log/mail.log", TrackerOptions::default())?;
/// while let Some(record) = reader.next_record()? {
///     print!("{}", String::from_utf8_lossy(&record));
/// }
/// reader.close()?;
/// # Ok::<(), TrackedReaderError>(())
/// ```
///
/// Records are returned as raw bytes including the trailing newline, if any.
///
/// ## Cleanup
///
/// There are two distinct ways to perform cleanup for this structure:
///
/// * **explicit** by calling `.close()`. This will allow you to handle any errors that may happen in the process
/// * **implicitly** by relying on `Drop`. Errors cannot be returned from a destructor, so a failed save is only
/// logged in this case.
///
/// ## Working principles
///
/// Position is persisted in a sidecar file (`<path>.offset` by default) as file identity (inode) plus byte offset.
/// When the tracked path turns out to be a different file than the one the offset was measured against, or it became
/// smaller than the offset, the file is considered rotated and `RotationResolver` looks for its predecessor. Remaining
/// content of the predecessor is read first, then reading continues from the beginning of the new file.
///
/// Rotation is only checked when available data is exhausted (and when a saved offset is loaded), so a file rotated
/// and refilled more than once between two checks cannot be followed.
///
/// ## Limitations
///
/// * Sidecar is not locked. Only one reader may track a given file at a time.
/// * If the predecessor cannot be found, reading continues according to `TrackerOptions::on_unresolved` which may
/// repeat or skip lines.
pub struct TrackedReader {
    path: PathBuf,
    options: TrackerOptions,
    store: OffsetStore,
    resolver: RotationResolver,
    handle: Handle,
    session: Session,
    cursor: ReadCursor,
    /// cursor currently held by the sidecar, if any
    last_saved: Option<ReadCursor>,
    since_save: usize,
    already_freed: bool,
}

impl TrackedReader {
    /// Creates a new `TrackedReader` possibly loading current offset from the sidecar file.
    ///
    /// Fails if the sidecar is malformed, a rotation pattern is invalid or the tracked file cannot be opened.
    pub fn new(
        filepath: impl Into<PathBuf>,
        options: TrackerOptions,
    ) -> Result<Self, TrackedReaderError> {
        let filepath = filepath.into();
        let store = OffsetStore::new(offset_path(&filepath, &options));
        Self::with_store(filepath, options, store)
    }

    /// Same as `new` but additionally calls `hook` right before each save. Hook error aborts the save and is returned
    /// to the caller of the operation that triggered it.
    pub fn with_update_hook(
        filepath: impl Into<PathBuf>,
        options: TrackerOptions,
        hook: impl FnMut() -> Result<(), HookError> + 'static,
    ) -> Result<Self, TrackedReaderError> {
        let filepath = filepath.into();
        let store = OffsetStore::new(offset_path(&filepath, &options)).with_update_hook(hook);
        Self::with_store(filepath, options, store)
    }

    fn with_store(
        path: PathBuf,
        options: TrackerOptions,
        store: OffsetStore,
    ) -> Result<Self, TrackedReaderError> {
        let resolver = RotationResolver::new(&path, &options.log_patterns, options.copytruncate)?
            .with_offset_file(store.path());
        let saved = store.load()?;
        let mut reader = Self {
            path,
            options,
            store,
            resolver,
            handle: Handle::Closed,
            session: Session::Normal,
            cursor: ReadCursor::default(),
            last_saved: saved,
            since_save: 0,
            // nothing to save until construction succeeds
            already_freed: true,
        };
        match saved {
            Some(saved) => reader.resume(saved)?,
            None => {
                let mut file = OpenFile::open(&reader.path)?;
                let offset = if reader.options.read_from_end {
                    file.source.skip_to_end()?
                } else {
                    0
                };
                reader.cursor = ReadCursor {
                    identity: file.identity,
                    offset,
                };
                reader.handle = Handle::Open(file);
            }
        }
        reader.already_freed = false;
        Ok(reader)
    }

    /// Return next unread record, or `None` if there is no more data at the moment.
    ///
    /// In follow mode this call sleeps and retries instead of returning `None`, except right after switching from a
    /// rotated file to a fresh empty one.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, TrackedReaderError> {
        loop {
            if let Some(record) = self.read_record()? {
                return self.produced(record);
            }
            if self.is_draining_rotated() {
                if self.leave_rotated()? {
                    // fresh file may still be empty, that ends this attempt even when following
                    return match self.read_record()? {
                        Some(record) => self.produced(record),
                        None => self.exhausted(),
                    };
                }
            } else if self.check_rotation()? {
                continue;
            }
            match self.options.follow {
                Some(interval) => {
                    // also covers switching files without producing anything
                    if self.options.save_on_exhaustion && self.last_saved != Some(self.cursor) {
                        self.persist()?;
                    }
                    std::thread::sleep(interval);
                }
                None => return self.exhausted(),
            }
        }
    }

    /// Read all currently available records
    pub fn read_all(&mut self) -> Result<Vec<Vec<u8>>, TrackedReaderError> {
        let mut records = vec![];
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Read all currently available records as one buffer. Returns `None` if there was nothing to read.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, TrackedReaderError> {
        let records = self.read_all()?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records.concat()))
    }

    /// Explicitly save current position into sidecar file and return any errors generated
    pub fn persist(&mut self) -> Result<(), TrackedReaderError> {
        self.store.save(self.cursor)?;
        self.last_saved = Some(self.cursor);
        self.since_save = 0;
        Ok(())
    }

    /// Explicitly finalize structure, returning any errors that were produced in the process. Alternative to relying
    /// on `Drop`.
    pub fn close(mut self) -> Result<(), TrackedReaderError> {
        self.already_freed = true;
        self.handle.close();
        self.persist()
    }

    /// Current in-memory position
    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    /// Whether remaining content of a rotated file is being read
    pub fn is_draining_rotated(&self) -> bool {
        matches!(self.session, Session::DrainingRotated(_))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn produced(&mut self, record: Vec<u8>) -> Result<Option<Vec<u8>>, TrackedReaderError> {
        self.since_save += 1;
        let every_n_reached = self.options.every_n > 0 && self.since_save >= self.options.every_n;
        if self.options.paranoid || every_n_reached {
            self.persist()?;
        }
        Ok(Some(record))
    }

    fn exhausted(&mut self) -> Result<Option<Vec<u8>>, TrackedReaderError> {
        if self.options.save_on_exhaustion {
            self.persist()?;
        }
        Ok(None)
    }

    /// Continue from saved position, switching to the rotated file if the tracked one was replaced or truncated
    fn resume(&mut self, saved: ReadCursor) -> Result<(), TrackedReaderError> {
        let unchanged = metadata_if_exists(&self.path)?.is_some_and(|current| {
            identity_from_metadata(&current) == saved.identity && !self.shrank(&current, saved.offset)
        });
        if unchanged {
            self.cursor = saved;
            return self.open_active();
        }
        tracing::debug!(path = %self.path.display(), "tracked file changed since last run");
        self.recover(saved)
    }

    /// Choose what to read after `expected` stopped matching the tracked path
    fn recover(&mut self, expected: ReadCursor) -> Result<(), TrackedReaderError> {
        self.handle.close();
        if let Some(candidate) = self.resolver.resolve(expected)? {
            tracing::debug!(rotated = %candidate.path.display(), "reading rest of rotated file");
            self.cursor = ReadCursor {
                identity: candidate.identity,
                offset: expected.offset,
            };
            self.session = Session::DrainingRotated(candidate);
            return self.open_active();
        }

        self.session = Session::Normal;
        let mut file = OpenFile::open(&self.path)?;
        let offset = if file.identity == expected.identity && !self.options.copytruncate {
            let actual = file.source.skip_to_end()?;
            Anomaly::Shrank {
                path: self.path.clone(),
                expected: expected.offset,
                actual,
            }
            .report();
            actual
        } else {
            let policy = self.options.on_unresolved;
            Anomaly::Unresolved {
                path: self.path.clone(),
                policy,
            }
            .report();
            match policy {
                UnresolvedRotation::FromStart => 0,
                UnresolvedRotation::FromEnd => file.source.skip_to_end()?,
            }
        };
        self.cursor = ReadCursor {
            identity: file.identity,
            offset,
        };
        self.handle = Handle::Open(file);
        Ok(())
    }

    /// Open file for current session positioned at cursor
    fn open_active(&mut self) -> Result<(), TrackedReaderError> {
        self.handle.close();
        let path = match &self.session {
            Session::Normal => &self.path,
            Session::DrainingRotated(candidate) => &candidate.path,
        };
        let mut file = OpenFile::open(path)?;
        self.cursor = ReadCursor {
            identity: file.identity,
            offset: file.source.skip_to(self.cursor.offset)?,
        };
        self.handle = Handle::Open(file);
        Ok(())
    }

    /// Switch from drained rotated file back to tracked path. Returns false if tracked path was not recreated yet.
    fn leave_rotated(&mut self) -> Result<bool, TrackedReaderError> {
        self.handle.close();
        let file = match OpenFile::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %self.path.display(), "rotated file drained, switching back");
        self.session = Session::Normal;
        self.cursor = ReadCursor {
            identity: file.identity,
            offset: 0,
        };
        self.handle = Handle::Open(file);
        Ok(true)
    }

    /// Called on exhaustion. Returns true if reading switched to another file.
    fn check_rotation(&mut self) -> Result<bool, TrackedReaderError> {
        // identity of the file actually read, path may already point elsewhere
        let Some(handle_identity) = self.handle.identity() else {
            return Ok(false);
        };
        let Some(current) = metadata_if_exists(&self.path)? else {
            return Ok(false);
        };
        let replaced = identity_from_metadata(&current) != handle_identity;
        let shrank = self.shrank(&current, self.cursor.offset);
        if !replaced && !shrank {
            return Ok(false);
        }
        tracing::debug!(path = %self.path.display(), replaced, shrank, "rotation detected");
        self.recover(ReadCursor {
            identity: handle_identity,
            offset: self.cursor.offset,
        })?;
        Ok(true)
    }

    /// Compressed size says nothing about decompressed offsets, so compressed files never count as shrunk
    fn shrank(&self, current: &Metadata, offset: u64) -> bool {
        !is_compressed(&self.path) && current.len() < offset
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>, TrackedReaderError> {
        if self.handle.as_open().is_none() {
            self.open_active()?;
        }
        // a rotated file will never be completed, so its last line is taken as is
        let full_lines = self.options.full_lines && matches!(self.session, Session::Normal);
        let Some(file) = self.handle.as_open() else {
            return Ok(None);
        };
        let mut record = vec![];
        let read = file.source.read_record(&mut record)?;
        if read == 0 {
            return Ok(None);
        }
        if full_lines && !record.ends_with(b"\n") {
            if !file.source.rewind_to(self.cursor.offset)? {
                self.handle.close();
            }
            return Ok(None);
        }
        self.cursor.offset += read as u64;
        Ok(Some(record))
    }
}

fn offset_path(filepath: &std::path::Path, options: &TrackerOptions) -> PathBuf {
    options
        .offset_file
        .clone()
        .unwrap_or_else(|| default_offset_path(filepath))
}

impl Iterator for TrackedReader {
    type Item = Result<Vec<u8>, TrackedReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Executes destructor. If `.close()` was not called previously, will write position to disk, logging any error.
/// If losing the error is not what you want, use `.close()` and handle errors manually instead.
impl Drop for TrackedReader {
    fn drop(&mut self) {
        if self.already_freed {
            return;
        }
        self.handle.close();
        if let Err(e) = self.persist() {
            tracing::warn!(path = %self.path.display(), "failed to save read position: {e}");
        }
    }
}
