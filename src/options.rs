use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// What to do when the tracked file was replaced but its rotated predecessor cannot be found
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedRotation {
    /// Read the new file from its beginning. May reprocess data if the file was filled from an old copy.
    #[default]
    FromStart,
    /// Skip whatever the new file already contains. May lose lines written before the tracker noticed.
    FromEnd,
}

/// Options controlling a `TrackedReader`
///
/// All fields are optional when deserializing:
///
/// ```rust
/// # use logtrack::TrackerOptions;
/// let options: TrackerOptions = serde_json::from_str(r#"{"every_n": 100, "follow": 500}"#)?;
/// assert_eq!(options.every_n, 100);
/// assert!(options.copytruncate);
/// assert_eq!(options.follow, Some(std::time::Duration::from_millis(500)));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerOptions {
    /// Sidecar location. Defaults to `<path>.offset`
    pub offset_file: Option<PathBuf>,
    /// Save offset after every record
    pub paranoid: bool,
    /// Save offset every `every_n` records. Zero disables
    pub every_n: usize,
    /// Recover from copy-truncate rotation. If disabled, a shrunk file is reported and read from its current end
    pub copytruncate: bool,
    /// Start from end of file when no offset was saved yet
    pub read_from_end: bool,
    /// Additional rotated filename globs tried after builtin ones. `{}` stands for the tracked file name
    pub log_patterns: Vec<String>,
    /// Only produce records terminated by a newline
    pub full_lines: bool,
    /// Wait for new data with this interval instead of returning end of data
    #[serde(with = "millis")]
    pub follow: Option<Duration>,
    /// Save offset whenever available data is exhausted
    pub save_on_exhaustion: bool,
    pub on_unresolved: UnresolvedRotation,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            offset_file: None,
            paranoid: false,
            every_n: 0,
            copytruncate: true,
            read_from_end: false,
            log_patterns: vec![],
            full_lines: false,
            follow: None,
            save_on_exhaustion: true,
            on_unresolved: UnresolvedRotation::default(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value
            .as_ref()
            .map(|interval| interval.as_millis() as u64)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
