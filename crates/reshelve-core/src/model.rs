use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A regular file discovered during scanning. Immutable once written to the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub absolute_path: PathBuf,
    /// Always `/`-separated, relative to the scan root.
    pub relative_path: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    /// Lowercase, without the leading dot. Empty when the file has none.
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub category: FileCategory,
    #[serde(default)]
    pub device_id: Option<u64>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub date_taken: Option<NaiveDateTime>,
}

impl FileRecord {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Name of the immediate parent folder, empty for files at the root.
    pub fn parent_name(&self) -> &str {
        let mut parts = self.relative_path.rsplit('/');
        parts.next();
        parts.next().unwrap_or("")
    }

    /// EXIF capture time when known, otherwise the modification time.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.date_taken
            .map(|taken| taken.and_utc())
            .unwrap_or(self.modified)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Photos,
    Videos,
    Audio,
    Documents,
    Archives,
    Code,
    #[default]
    Misc,
}

impl FileCategory {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tif" | "tiff" | "webp" | "heic" | "heif"
            | "raw" | "cr2" | "cr3" | "nef" | "arw" | "dng" | "orf" | "rw2" => Self::Photos,
            "mp4" | "mov" | "avi" | "mkv" | "wmv" | "flv" | "webm" | "m4v" | "mts" | "m2ts"
            | "3gp" | "mpg" | "mpeg" => Self::Videos,
            "mp3" | "wav" | "flac" | "aac" | "m4a" | "ogg" | "wma" | "aiff" | "aif" | "opus" => {
                Self::Audio
            }
            "pdf" | "doc" | "docx" | "txt" | "rtf" | "odt" | "xls" | "xlsx" | "ppt" | "pptx"
            | "md" | "csv" | "pages" | "numbers" | "key" | "epub" => Self::Documents,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "xz" | "dmg" | "iso" => Self::Archives,
            "rs" | "py" | "js" | "ts" | "c" | "h" | "cpp" | "java" | "go" | "rb" | "sh" | "json"
            | "toml" | "yaml" | "yml" | "html" | "css" => Self::Code,
            _ => Self::Misc,
        }
    }

    /// Folder name substituted for `{type}` in destination templates.
    pub fn folder_name(self) -> &'static str {
        match self {
            Self::Photos => "Photos",
            Self::Videos => "Videos",
            Self::Audio => "Audio",
            Self::Documents => "Documents",
            Self::Archives => "Archives",
            Self::Code => "Code",
            Self::Misc => "Misc",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name())
    }
}

/// One planned move. Plans and undo plans share this schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub source: PathBuf,
    /// Destination produced by the matched rule, before collision resolution.
    pub destination: PathBuf,
    pub final_destination: PathBuf,
    pub rule: String,
}

impl MoveRecord {
    pub fn is_noop(&self) -> bool {
        self.source == self.final_destination
    }

    /// The record that reverses this move.
    pub fn inverted(&self) -> MoveRecord {
        let rule = match self.rule.strip_prefix("undo:") {
            Some(original) => original.to_string(),
            None => format!("undo:{}", self.rule),
        };
        MoveRecord {
            source: self.final_destination.clone(),
            destination: self.source.clone(),
            final_destination: self.source.clone(),
            rule,
        }
    }
}

/// A move kept out of the executable plan by the drive guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedMove {
    pub record: MoveRecord,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MoveOutcome {
    Moved,
    SkippedIdentical { reason: String },
    Failed { reason: String },
    /// Kept out of the executable plan by the drive guard.
    Blocked { reason: String },
}

impl MoveOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::SkippedIdentical {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveResult {
    pub record: MoveRecord,
    #[serde(flatten)]
    pub outcome: MoveOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub dry_run: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub moved: usize,
    pub skipped_identical: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cleaned_directories: usize,
    /// Every non-succeeded record with its reason.
    pub failures: Vec<MoveResult>,
}

impl ExecutionReport {
    pub fn record(&mut self, result: MoveResult) {
        match &result.outcome {
            MoveOutcome::Moved => self.moved += 1,
            MoveOutcome::SkippedIdentical { .. } => {
                self.skipped_identical += 1;
                // Files already in place are counted, not enumerated.
                if !result.record.is_noop() {
                    self.failures.push(result);
                }
            }
            MoveOutcome::Failed { .. } => {
                self.failed += 1;
                self.failures.push(result);
            }
            MoveOutcome::Blocked { .. } => {
                self.blocked += 1;
                self.failures.push(result);
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(rel: &str) -> FileRecord {
        FileRecord {
            absolute_path: PathBuf::from("/root").join(rel),
            relative_path: rel.to_string(),
            size_bytes: 1,
            modified: Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap(),
            created: None,
            extension: "jpg".to_string(),
            category: FileCategory::Photos,
            device_id: None,
            cluster_id: None,
            date_taken: None,
        }
    }

    #[test]
    fn test_file_name_and_parent() {
        let r = record("trips/hawaii/IMG_001.jpg");
        assert_eq!(r.file_name(), "IMG_001.jpg");
        assert_eq!(r.parent_name(), "hawaii");
        assert_eq!(record("top.jpg").parent_name(), "");
    }

    #[test]
    fn test_effective_time_prefers_date_taken() {
        let mut r = record("a.jpg");
        assert_eq!(r.effective_time(), r.modified);
        let taken = chrono::NaiveDate::from_ymd_opt(2019, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        r.date_taken = Some(taken);
        assert_eq!(r.effective_time(), taken.and_utc());
    }

    #[test]
    fn test_inverted_round_trips_rule_prefix() {
        let m = MoveRecord {
            source: PathBuf::from("/r/a.jpg"),
            destination: PathBuf::from("/r/Photos/a.jpg"),
            final_destination: PathBuf::from("/r/Photos/a_1.jpg"),
            rule: "photos".to_string(),
        };
        let undo = m.inverted();
        assert_eq!(undo.source, PathBuf::from("/r/Photos/a_1.jpg"));
        assert_eq!(undo.final_destination, PathBuf::from("/r/a.jpg"));
        assert_eq!(undo.rule, "undo:photos");
        assert_eq!(undo.inverted().rule, "photos");
    }

    #[test]
    fn test_category_from_extension() {
        assert_eq!(FileCategory::from_extension("JPG"), FileCategory::Photos);
        assert_eq!(FileCategory::from_extension("mkv"), FileCategory::Videos);
        assert_eq!(FileCategory::from_extension("pdf"), FileCategory::Documents);
        assert_eq!(FileCategory::from_extension(""), FileCategory::Misc);
    }
}
