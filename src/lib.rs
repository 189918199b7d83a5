//! # Logtrack
//!
//! Logtrack is a library for incremental reading of growing log files, similar to `logtail` and the mechanisms used in
//! Filebeat and other software alike. Each run returns only lines appended since the previous one, even if the file was
//! rotated by `logrotate`, `savelog` or a logging framework in between. It is meant to be run periodically (eg. from
//! cron) but can also follow a file continuously.
//!
//! * `TrackedReader` that reads new records of a single file and persists its position in a sidecar file
//!
//! ```rust no_run
//! # use logtrack::{TrackedReader, TrackedReaderError, TrackerOptions};
//! // running this script will fetch and print new lines on each execution
//! # fn main() -> Result<(), TrackedReaderError> {
//! let mut reader = TrackedReader::new("/var/log/mail.log", TrackerOptions::default())?;
//! for record in &mut reader {
//!     print!("{}", String::from_utf8_lossy(&record?));
//! }
//! reader.close()
//! # }
//! ```
//!
//! * `TrackerOptions` controlling save cadence, rotation handling and follow mode. It implements serde traits so it can
//! be a part of your configuration file.
//!
//! ```rust no_run
//! # use logtrack::{TrackedReader, TrackedReaderError, TrackerOptions};
//! let options = TrackerOptions {
//!     every_n: 100,
//!     log_patterns: vec!["archive/{}.old".to_string()],
//!     full_lines: true,
//!     ..Default::default()
//! };
//! let reader = TrackedReader::with_update_hook("/var/log/mail.log", options, || {
//!     // flush whatever consumed the records so far before their position is saved
//!     Ok(())
//! })?;
//! # Ok::<(), TrackedReaderError>(())
//! ```
//!
//! * `RotationResolver` that locates the rotated predecessor of a file, for those who want to keep state elsewhere
//!
//! * `DirectoryTracker` that interleaves records of every matching file in a directory
//!
//! Problems that do not stop reading, like a file that shrank while copytruncate support is disabled, are reported as
//! `tracing` warnings in a stable `[logtrack] [WARN] ...` shape.
//!

mod multiplexer;
mod offset_store;
mod options;
pub mod path_utils;
mod rotation;
mod source;
mod tracked_reader;

pub use multiplexer::{DirectoryTracker, DirectoryTrackerError};
pub use offset_store::{HookError, OffsetStore, OffsetStoreError, ReadCursor, UpdateHook};
pub use options::{TrackerOptions, UnresolvedRotation};
pub use rotation::{Anomaly, PatternError, RotationCandidate, RotationResolver};
pub use source::LogSource;
pub use tracked_reader::{TrackedReader, TrackedReaderError};
