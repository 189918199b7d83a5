use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    offset_store::{is_temp_file, ReadCursor},
    options::UnresolvedRotation,
    path_utils::{
        append_extension, fill_placeholder, identity_from_metadata, is_compressed, metadata_if_exists,
        FileIdentity, NAME_PLACEHOLDER,
    },
};

/// Globs for rotated names produced by date-based rotation, tried in order after numbered suffixes
const DATED_PATTERNS: &[&str] = &[
    // logrotate dateext, `dateformat -%Y%m%d`, delaycompress
    "{}-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]",
    // logrotate dateext, `dateformat -%Y%m%d`
    "{}-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9].gz",
    // logrotate dateext, `dateformat -%Y%m%d-%s`, delaycompress
    "{}-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]",
    // logrotate dateext, `dateformat -%Y%m%d-%s`
    "{}-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9]-[0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9][0-9].gz",
    // time based rotating handlers
    "{}.[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]",
];

/// Problems with user supplied rotated filename patterns
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("rotation pattern `{0}` does not contain `{{}}` placeholder")]
    MissingPlaceholder(String),
    #[error("rotation pattern `{pattern}` is not a valid glob")]
    Invalid {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// File that is believed to hold content previously available under tracked path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationCandidate {
    pub path: PathBuf,
    pub identity: FileIdentity,
}

/// Unexpected situations that do not stop reading but may cause lost or repeated lines
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// File kept its identity but became smaller than saved offset while copytruncate recovery is disabled
    Shrank {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// File was rotated but no predecessor could be found
    Unresolved {
        path: PathBuf,
        policy: UnresolvedRotation,
    },
}

impl Anomaly {
    /// Emit anomaly as a warning
    pub fn report(&self) {
        tracing::warn!("{self}");
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::Shrank {
                path,
                expected,
                actual,
            } => write!(
                f,
                "[logtrack] [WARN] file size of {} shrank, and copytruncate support is disabled \
                 (expected at least {expected} bytes, was {actual} bytes)",
                path.display()
            ),
            Anomaly::Unresolved { path, policy } => {
                let from = match policy {
                    UnresolvedRotation::FromStart => "start",
                    UnresolvedRotation::FromEnd => "end",
                };
                write!(
                    f,
                    "[logtrack] [WARN] {} was rotated but its previous version was not found, \
                     continuing from the {from} of the current file",
                    path.display()
                )
            }
        }
    }
}

/// Searches for the file that holds content rotated away from tracked path.
///
/// Probes, first match wins:
///
/// 1. `{path}.0` if `{path}.1.gz` exists and is older (savelog)
/// 2. `{path}.1` (logrotate with delaycompress)
/// 3. `{path}.1.gz` (logrotate)
/// 4. dated suffixes: `-YYYYMMDD`, `-YYYYMMDD-SSSSSSSSSS` (each optionally `.gz`) and `.YYYY-MM-DD`
/// 5. user patterns, where `{}` stands for the tracked file name
///
/// Globs matching several files resolve to the lexically greatest name, which is the latest one for fixed width dates.
/// Tracked path itself, the sidecar set with `with_offset_file` and temporary sidecar files never match.
#[derive(Clone, Debug)]
pub struct RotationResolver {
    path: PathBuf,
    patterns: Vec<String>,
    copytruncate: bool,
    offset_file: Option<PathBuf>,
}

impl RotationResolver {
    pub fn new(
        path: impl Into<PathBuf>,
        custom_patterns: &[String],
        copytruncate: bool,
    ) -> Result<Self, PatternError> {
        for pattern in custom_patterns {
            validate_pattern(pattern)?;
        }
        let patterns = DATED_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(custom_patterns.iter().cloned())
            .collect();
        Ok(Self {
            path: path.into(),
            patterns,
            copytruncate,
            offset_file: None,
        })
    }

    /// Exclude the sidecar holding offsets of tracked path from glob matches
    pub fn with_offset_file(mut self, offset_file: impl Into<PathBuf>) -> Self {
        self.offset_file = Some(offset_file.into());
        self
    }

    /// Find the predecessor of tracked path given the cursor saved against it.
    ///
    /// A structural match is accepted if it is the very file `expected` was measured against, or if tracked path
    /// kept `expected` identity but shrank below saved offset (copy-truncate) and copytruncate recovery is enabled.
    /// In every other case `None` is returned and reporting is left to the caller.
    pub fn resolve(&self, expected: ReadCursor) -> io::Result<Option<RotationCandidate>> {
        let Some(candidate) = self.find_candidate()? else {
            tracing::debug!(path = %self.path.display(), "no rotated file found");
            return Ok(None);
        };
        let Some(candidate_meta) = metadata_if_exists(&candidate)? else {
            return Ok(None);
        };
        let identity = identity_from_metadata(&candidate_meta);
        if identity == expected.identity {
            tracing::debug!(candidate = %candidate.display(), "rotated file resolved by identity");
            return Ok(Some(RotationCandidate {
                path: candidate,
                identity,
            }));
        }

        let copy_truncated = metadata_if_exists(&self.path)?.is_some_and(|current| {
            identity_from_metadata(&current) == expected.identity
                && !is_compressed(&self.path)
                && current.len() < expected.offset
        });
        if copy_truncated && self.copytruncate {
            tracing::debug!(candidate = %candidate.display(), "rotated file resolved as truncated copy");
            return Ok(Some(RotationCandidate {
                path: candidate,
                identity,
            }));
        }
        Ok(None)
    }

    /// Find first path matching rotation naming schemes, without checking its identity
    pub fn find_candidate(&self) -> io::Result<Option<PathBuf>> {
        let savelog = append_extension(self.path.clone(), "0");
        let compressed = append_extension(self.path.clone(), "1.gz");
        if let (Some(savelog_meta), Some(compressed_meta)) =
            (metadata_if_exists(&savelog)?, metadata_if_exists(&compressed)?)
        {
            if savelog_meta.modified()? > compressed_meta.modified()? {
                return Ok(Some(savelog));
            }
        }

        let delaycompressed = append_extension(self.path.clone(), "1");
        if delaycompressed.exists() {
            return Ok(Some(delaycompressed));
        }
        if compressed.exists() {
            return Ok(Some(compressed));
        }

        let (Some(dir), Some(name)) = (glob_dir(&self.path), file_name(&self.path)) else {
            return Ok(None);
        };
        for template in &self.patterns {
            let pattern = format!("{dir}{}", fill_placeholder(template, name));
            let Ok(paths) = glob::glob(&pattern) else {
                continue;
            };
            let mut matches = paths
                .filter_map(Result::ok)
                .filter(|candidate| !self.is_excluded(candidate))
                .collect::<Vec<_>>();
            matches.sort();
            if let Some(latest) = matches.pop() {
                return Ok(Some(latest));
            }
        }
        Ok(None)
    }
}

impl RotationResolver {
    fn is_excluded(&self, candidate: &Path) -> bool {
        candidate == self.path
            || self.offset_file.as_deref() == Some(candidate)
            || is_temp_file(candidate)
    }
}

fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if !pattern.contains(NAME_PLACEHOLDER) {
        return Err(PatternError::MissingPlaceholder(pattern.to_string()));
    }
    glob::Pattern::new(&fill_placeholder(pattern, "name")).map_err(|source| {
        PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        }
    })?;
    Ok(())
}

/// Glob-escaped directory of `path` with trailing separator, empty for bare file names
fn glob_dir(path: &Path) -> Option<String> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let escaped = glob::Pattern::escape(parent.to_str()?);
            Some(format!("{escaped}{}", std::path::MAIN_SEPARATOR))
        }
        _ => Some(String::new()),
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name()?.to_str()
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        time::{Duration, SystemTime},
    };

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::path_utils::{append_suffix, identity_of};

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
    }

    impl Fixture {
        fn sibling(&self, suffix: &str) -> PathBuf {
            append_suffix(self.path.clone(), suffix)
        }

        fn touch(&self, suffix: &str) -> PathBuf {
            let path = self.sibling(suffix);
            std::fs::write(&path, b"rotated\n").unwrap();
            path
        }

        fn resolver(&self) -> RotationResolver {
            RotationResolver::new(&self.path, &[], true).unwrap()
        }
    }

    #[fixture]
    fn log() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"1\n2\n3\n").unwrap();
        Fixture { _dir: dir, path }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[rstest]
    #[case(".1")]
    #[case(".1.gz")]
    #[case("-20160616")]
    #[case("-20160616.gz")]
    #[case("-20160616-1466093571")]
    #[case("-20160616-1466093571.gz")]
    #[case(".2016-06-16")]
    fn builtin_schemes_are_found(log: Fixture, #[case] suffix: &str) {
        let expected = log.touch(suffix);
        assert_eq!(log.resolver().find_candidate().unwrap(), Some(expected));
    }

    #[rstest]
    fn delaycompressed_file_wins_over_compressed(log: Fixture) {
        log.touch(".1.gz");
        let expected = log.touch(".1");
        assert_eq!(log.resolver().find_candidate().unwrap(), Some(expected));
    }

    #[rstest]
    fn newest_date_wins(log: Fixture) {
        log.touch("-20160615");
        let expected = log.touch("-20160616");
        log.touch("-20151231");
        assert_eq!(log.resolver().find_candidate().unwrap(), Some(expected));
    }

    #[rstest]
    fn savelog_zero_requires_older_compressed_sibling(log: Fixture) {
        let zero = log.touch(".0");
        assert_eq!(log.resolver().find_candidate().unwrap(), None);

        let compressed = log.touch(".1.gz");
        let now = SystemTime::now();
        set_mtime(&compressed, now - Duration::from_secs(3600));
        set_mtime(&zero, now);
        assert_eq!(log.resolver().find_candidate().unwrap(), Some(zero.clone()));

        set_mtime(&zero, now - Duration::from_secs(7200));
        assert_eq!(log.resolver().find_candidate().unwrap(), Some(compressed));
    }

    #[rstest]
    fn custom_pattern_may_prefix_name(log: Fixture) {
        let dir = log.path.parent().unwrap();
        let rotated = dir.join("custom_log_pattern.app.log");
        std::fs::write(&rotated, b"x\n").unwrap();

        let patterns = vec!["custom_log_pattern.{}".to_string()];
        let resolver = RotationResolver::new(&log.path, &patterns, true).unwrap();
        assert_eq!(resolver.find_candidate().unwrap(), Some(rotated));
        assert_eq!(log.resolver().find_candidate().unwrap(), None);
    }

    #[rstest]
    fn custom_pattern_never_matches_tracked_file(log: Fixture) {
        let patterns = vec!["{}*".to_string()];
        let resolver = RotationResolver::new(&log.path, &patterns, true).unwrap();
        assert_eq!(resolver.find_candidate().unwrap(), None);
    }

    #[rstest]
    fn custom_pattern_never_matches_sidecar(log: Fixture) {
        let offset_file = log.touch(".offset");
        let archive = log.touch(".archive");

        let patterns = vec!["{}.*".to_string()];
        let resolver = RotationResolver::new(&log.path, &patterns, true).unwrap();
        assert_eq!(resolver.find_candidate().unwrap(), Some(offset_file.clone()));

        let resolver = resolver.with_offset_file(&offset_file);
        assert_eq!(resolver.find_candidate().unwrap(), Some(archive.clone()));

        std::fs::remove_file(&archive).unwrap();
        assert_eq!(resolver.find_candidate().unwrap(), None);
    }

    #[rstest]
    #[case("archive.log")]
    #[case("[{}")]
    fn bad_patterns_are_rejected(log: Fixture, #[case] pattern: &str) {
        assert!(RotationResolver::new(&log.path, &[pattern.to_string()], true).is_err());
    }

    #[rstest]
    fn renamed_file_is_resolved_by_identity(log: Fixture) {
        let identity = identity_of(&log.path).unwrap();
        let rotated = log.sibling(".1");
        std::fs::rename(&log.path, &rotated).unwrap();
        std::fs::write(&log.path, b"").unwrap();

        let candidate = log
            .resolver()
            .resolve(ReadCursor {
                identity,
                offset: 6,
            })
            .unwrap();
        assert_eq!(candidate, Some(RotationCandidate { path: rotated, identity }));
    }

    #[rstest]
    fn unrelated_file_is_rejected(log: Fixture) {
        log.touch(".1");
        std::fs::remove_file(&log.path).unwrap();
        std::fs::write(&log.path, b"").unwrap();

        let stale = ReadCursor {
            identity: 1,
            offset: 6,
        };
        assert_eq!(log.resolver().resolve(stale).unwrap(), None);
    }

    #[rstest]
    #[case(true, true)]
    #[case(false, false)]
    fn truncated_copy_depends_on_policy(log: Fixture, #[case] copytruncate: bool, #[case] found: bool) {
        let identity = identity_of(&log.path).unwrap();
        std::fs::copy(&log.path, log.sibling(".1")).unwrap();
        File::create(&log.path).unwrap();

        let resolver = RotationResolver::new(&log.path, &[], copytruncate).unwrap();
        let candidate = resolver
            .resolve(ReadCursor {
                identity,
                offset: 6,
            })
            .unwrap();
        assert_eq!(candidate.is_some(), found);
    }

    #[test]
    fn shrink_warning_has_stable_shape() {
        let anomaly = Anomaly::Shrank {
            path: "/var/log/app.log".into(),
            expected: 6,
            actual: 4,
        };
        assert_eq!(
            anomaly.to_string(),
            "[logtrack] [WARN] file size of /var/log/app.log shrank, and copytruncate support is \
             disabled (expected at least 6 bytes, was 4 bytes)"
        );
    }
}
