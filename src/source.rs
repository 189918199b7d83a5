use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use flate2::read::MultiGzDecoder;

use crate::path_utils::{identity_from_metadata, is_compressed, FileIdentity};

/// Sequential byte stream over a log file, decompressing `.gz` files transparently.
///
/// Offsets into compressed files are measured in decompressed bytes.
pub enum LogSource {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
}

impl LogSource {
    /// Open `file` (already opened from `path`) choosing variant by suffix of `path`
    pub fn from_file(path: &Path, file: File) -> Self {
        if is_compressed(path) {
            LogSource::Gzip(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            LogSource::Plain(BufReader::new(file))
        }
    }

    /// Move to `offset`. Compressed streams are skipped forward by decoding.
    ///
    /// Returns resulting position, which is smaller than requested if the stream ends earlier.
    pub fn skip_to(&mut self, offset: u64) -> io::Result<u64> {
        match self {
            LogSource::Plain(reader) => {
                let size = reader.get_ref().metadata()?.len();
                reader.seek(SeekFrom::Start(offset.min(size)))
            }
            LogSource::Gzip(reader) => io::copy(&mut reader.by_ref().take(offset), &mut io::sink()),
        }
    }

    /// Move to the end of the stream and return its length
    pub fn skip_to_end(&mut self) -> io::Result<u64> {
        match self {
            LogSource::Plain(reader) => reader.seek(SeekFrom::End(0)),
            LogSource::Gzip(reader) => io::copy(reader, &mut io::sink()),
        }
    }

    /// Move back to `offset` after a partial read. Returns false if stream cannot go back and must be reopened.
    pub fn rewind_to(&mut self, offset: u64) -> io::Result<bool> {
        match self {
            LogSource::Plain(reader) => {
                reader.seek(SeekFrom::Start(offset))?;
                Ok(true)
            }
            LogSource::Gzip(_) => Ok(false),
        }
    }

    fn reader(&mut self) -> &mut dyn BufRead {
        match self {
            LogSource::Plain(reader) => reader,
            LogSource::Gzip(reader) => reader,
        }
    }

    /// Read bytes up to and including next `\n` (or up to end of stream) appending them to `buf`
    pub fn read_record(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.reader().read_until(b'\n', buf)
    }
}

/// Open file handle together with identity of the file it was opened on
pub struct OpenFile {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub source: LogSource,
}

impl OpenFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let identity = identity_from_metadata(&file.metadata()?);
        let source = LogSource::from_file(&path, file);
        Ok(Self {
            path,
            identity,
            source,
        })
    }

    /// Size of underlying file as seen through the handle (compressed size for `.gz`)
    pub fn file_len(&self) -> io::Result<u64> {
        let file = match &self.source {
            LogSource::Plain(reader) => reader.get_ref(),
            LogSource::Gzip(reader) => reader.get_ref().get_ref(),
        };
        Ok(file.metadata()?.len())
    }
}

/// Read handle of a tracker. At most one file is open at any time.
#[derive(Default)]
pub enum Handle {
    #[default]
    Closed,
    Open(OpenFile),
}

impl Handle {
    pub fn as_open(&mut self) -> Option<&mut OpenFile> {
        match self {
            Handle::Open(file) => Some(file),
            Handle::Closed => None,
        }
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        match self {
            Handle::Open(file) => Some(file.identity),
            Handle::Closed => None,
        }
    }

    pub fn close(&mut self) {
        *self = Handle::Closed;
    }
}
