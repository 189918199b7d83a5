use std::{
    ffi::{OsStr, OsString},
    fs::Metadata,
    io,
    os::unix::prelude::MetadataExt,
    path::{Path, PathBuf},
};

/// Placeholder that custom rotation patterns use to refer to the tracked file name
pub const NAME_PLACEHOLDER: &str = "{}";

/// Filesystem-level identity of a file (its inode).
///
/// Two paths with equal identity refer to the same underlying file, even if one of them was renamed in between.
pub type FileIdentity = u64;

/// Ask the filesystem for metadata and return identity for fs object specified by `path`
pub fn identity_of(path: impl AsRef<Path>) -> io::Result<FileIdentity> {
    let metadata = std::fs::metadata(&path)?;
    Ok(metadata.ino())
}

/// Extract identity from already fetched metadata (eg. from an open handle)
pub fn identity_from_metadata(metadata: &Metadata) -> FileIdentity {
    metadata.ino()
}

/// Same as `std::fs::metadata`, but maps a missing file to `None`
pub fn metadata_if_exists(path: impl AsRef<Path>) -> io::Result<Option<Metadata>> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Add extension to existing PathBuf
///
/// ## Example
///
/// ```rust
/// use std::path::PathBuf;
/// let original_path = "/var/log/mail.log".into();
/// let rotated_path = logtrack::path_utils::append_extension(original_path, "1");
/// assert_eq!(rotated_path, PathBuf::from("/var/log/mail.log.1"));
/// ```
pub fn append_extension(path: PathBuf, ext: impl AsRef<OsStr>) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(".");
    os_string.push(ext.as_ref());
    os_string.into()
}

/// Append raw `suffix` to the last component of `path` without inserting any separator
#[cfg(test)]
pub(crate) fn append_suffix(path: PathBuf, suffix: impl AsRef<OsStr>) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(suffix.as_ref());
    os_string.into()
}

/// Default location of the sidecar holding persisted offset for `path`
pub fn default_offset_path(path: impl AsRef<Path>) -> PathBuf {
    append_extension(path.as_ref().to_path_buf(), "offset")
}

/// Check whether `path` names a gzip-compressed file
pub fn is_compressed(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false)
}

/// Substitute every placeholder in `template` with glob-escaped `name`
pub fn fill_placeholder(template: &str, name: &str) -> String {
    template.replace(NAME_PLACEHOLDER, &glob::Pattern::escape(name))
}
