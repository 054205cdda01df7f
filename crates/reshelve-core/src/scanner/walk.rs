use crate::config::{normalize_extensions, AppConfig};
use crate::error::Error;
use crate::model::{FileCategory, FileRecord};
use crate::paths;
use crate::platform;
use chrono::{DateTime, NaiveDateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Supplies the capture date for a file, e.g. from EXIF. Implementations must
/// not fail: anything unreadable is simply `None`.
pub trait DateEnricher: Send + Sync {
    fn date_taken(&self, path: &Path, extension: &str) -> Option<NaiveDateTime>;
}

/// Enricher that never finds a capture date.
pub struct NoEnrichment;

impl DateEnricher for NoEnrichment {
    fn date_taken(&self, _path: &Path, _extension: &str) -> Option<NaiveDateTime> {
        None
    }
}

impl<F> DateEnricher for F
where
    F: Fn(&Path, &str) -> Option<NaiveDateTime> + Send + Sync,
{
    fn date_taken(&self, path: &Path, extension: &str) -> Option<NaiveDateTime> {
        self(path, extension)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub ignore_patterns: Vec<Pattern>,
    pub ignore_folders: Vec<String>,
    pub skip_hidden: bool,
    pub min_size: u64,
    pub ext_include: Option<Vec<String>>,
    pub ext_exclude: Option<Vec<String>>,
    /// Absolute files never indexed, e.g. the tool's own output artifacts.
    pub exclude_paths: Vec<PathBuf>,
}

impl ScanOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let ignore_patterns = config
            .ignore_patterns
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            ignore_patterns,
            ignore_folders: config.ignore_folders.clone(),
            skip_hidden: config.skip_hidden,
            min_size: config.min_size,
            ext_include: config.ext_include.as_deref().map(normalize_extensions),
            ext_exclude: config.ext_exclude.as_deref().map(normalize_extensions),
            exclude_paths: Vec::new(),
        }
    }

    /// Exclude `paths` from the scan. Relative paths are resolved against
    /// the working directory; the files need not exist yet.
    pub fn excluding<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.exclude_paths
            .extend(paths.into_iter().map(|p| paths::absolutize(p.as_ref())));
        self
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_paths.iter().any(|excluded| excluded == path)
    }

    fn prune_dir(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        self.ignore_folders.iter().any(|f| f.as_str() == name)
            || self
                .ignore_patterns
                .iter()
                .any(|pattern| pattern.matches_path(entry.path()))
    }

    fn accepts(&self, path: &Path, extension: &str, size: u64) -> bool {
        if let Some(include) = &self.ext_include {
            if !include.iter().any(|e| e == extension) {
                return false;
            }
        }
        if let Some(exclude) = &self.ext_exclude {
            if exclude.iter().any(|e| e == extension) {
                return false;
            }
        }
        if size < self.min_size {
            return false;
        }
        !self
            .ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_path(path))
    }
}

/// An entry the scan could not read. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSkip {
    pub path: PathBuf,
    pub reason: String,
}

/// Lazy single-pass walk producing one [`FileRecord`] per regular file.
///
/// Memory use is bounded by directory depth, not by tree size: `walkdir`
/// keeps only the stack of directories currently being read.
pub struct Scan<'a> {
    root: PathBuf,
    walker: walkdir::IntoIter,
    options: ScanOptions,
    enricher: &'a dyn DateEnricher,
    skip_log: Option<Box<dyn Write + Send + 'a>>,
    skipped: usize,
    filtered: usize,
}

/// Start scanning `root`. Fails only if `root` is missing or not a directory.
pub fn scan<'a>(
    root: &Path,
    options: ScanOptions,
    enricher: &'a dyn DateEnricher,
) -> Result<Scan<'a>, Error> {
    let root = match fs::canonicalize(root) {
        Ok(r) if r.is_dir() => r,
        _ => return Err(Error::RootNotFound(root.to_path_buf())),
    };
    debug!("Scanning {}", root.display());

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    Ok(Scan {
        root,
        walker,
        options,
        enricher,
        skip_log: None,
        skipped: 0,
        filtered: 0,
    })
}

impl<'a> Scan<'a> {
    /// Stream every [`ScanSkip`] as one JSON line into `writer`.
    pub fn with_skip_log(mut self, writer: impl Write + Send + 'a) -> Self {
        self.skip_log = Some(Box::new(writer));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn filtered(&self) -> usize {
        self.filtered
    }

    fn record_skip(&mut self, path: PathBuf, reason: String) {
        warn!("Skipping unreadable entry {}: {}", path.display(), reason);
        self.skipped += 1;
        if let Some(log) = self.skip_log.as_mut() {
            let skip = ScanSkip { path, reason };
            let written = serde_json::to_string(&skip)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(log, "{}", line));
            if let Err(e) = written {
                error!("Failed to write scan skip log: {}", e);
            }
        }
    }

    fn build_record(&mut self, entry: &DirEntry) -> Option<FileRecord> {
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                self.record_skip(path.to_path_buf(), e.to_string());
                return None;
            }
        };

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if !self.options.accepts(path, &extension, metadata.len()) {
            self.filtered += 1;
            return None;
        }

        let relative_path = paths::relative_slash_path(&self.root, path)?;
        let modified = match metadata.modified() {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(e) => {
                self.record_skip(path.to_path_buf(), e.to_string());
                return None;
            }
        };
        let created = metadata.created().ok().map(DateTime::<Utc>::from);
        let device_id = platform::device_id(path).ok();
        let date_taken = self.enricher.date_taken(path, &extension);
        let category = FileCategory::from_extension(&extension);

        trace!("Scanned {}", relative_path);
        Some(FileRecord {
            absolute_path: path.to_path_buf(),
            relative_path,
            size_bytes: metadata.len(),
            modified,
            created,
            extension,
            category,
            device_id,
            cluster_id: None,
            date_taken,
        })
    }
}

impl Iterator for Scan<'_> {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    self.record_skip(path, err.to_string());
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if entry.depth() > 0 && self.options.prune_dir(&entry) {
                    trace!("Pruning {}", entry.path().display());
                    self.walker.skip_current_dir();
                }
                continue;
            }
            if file_type.is_symlink() || !file_type.is_file() {
                continue;
            }

            if self.options.is_excluded(entry.path()) {
                trace!("Excluding {}", entry.path().display());
                self.filtered += 1;
                continue;
            }
            if self.options.skip_hidden && entry.file_name().to_string_lossy().starts_with('.') {
                self.filtered += 1;
                continue;
            }

            if let Some(record) = self.build_record(&entry) {
                return Some(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_missing_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = scan(&missing, ScanOptions::default(), &NoEnrichment).err().unwrap();
        assert!(matches!(err, Error::RootNotFound(_)));
    }

    #[test]
    fn test_scan_file_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file.txt");
        touch(&file, b"x");
        assert!(matches!(
            scan(&file, ScanOptions::default(), &NoEnrichment),
            Err(Error::RootNotFound(_))
        ));
    }

    #[test]
    fn test_scan_yields_relative_slash_paths() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a/b/photo.JPG"), b"jpeg");
        touch(&tmp.path().join("notes.txt"), b"hello");

        let records: Vec<FileRecord> =
            scan(tmp.path(), ScanOptions::default(), &NoEnrichment).unwrap().collect();
        let mut rels: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        rels.sort();
        assert_eq!(rels, vec!["a/b/photo.JPG", "notes.txt"]);

        let photo = records.iter().find(|r| r.extension == "jpg").unwrap();
        assert_eq!(photo.category, FileCategory::Photos);
        assert_eq!(photo.size_bytes, 4);
        assert!(photo.device_id.is_some());
    }

    #[test]
    fn test_scan_filters_and_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join(".hidden"), b"x");
        touch(&tmp.path().join("$RECYCLE.BIN/junk.jpg"), b"x");
        touch(&tmp.path().join("keep.jpg"), b"xxxx");
        touch(&tmp.path().join("small.jpg"), b"x");
        touch(&tmp.path().join("doc.pdf"), b"xxxx");

        let options = ScanOptions {
            ignore_folders: vec!["$RECYCLE.BIN".to_string()],
            skip_hidden: true,
            min_size: 2,
            ext_exclude: Some(vec!["pdf".to_string()]),
            ..ScanOptions::default()
        };
        let mut scan = scan(tmp.path(), options, &NoEnrichment).unwrap();
        let rels: Vec<String> = scan.by_ref().map(|r| r.relative_path).collect();
        assert_eq!(rels, vec!["keep.jpg"]);
        assert_eq!(scan.filtered(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("real.txt"), b"x");
        std::os::unix::fs::symlink(tmp.path().join("real.txt"), tmp.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("broken")).unwrap();

        let rels: Vec<String> = scan(tmp.path(), ScanOptions::default(), &NoEnrichment)
            .unwrap()
            .map(|r| r.relative_path)
            .collect();
        assert_eq!(rels, vec!["real.txt"]);
    }

    #[test]
    fn test_scan_uses_enricher() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("img.jpg"), b"x");
        let taken = chrono::NaiveDate::from_ymd_opt(2020, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap();
        let enricher = move |_: &Path, ext: &str| (ext == "jpg").then_some(taken);
        let record = scan(tmp.path(), ScanOptions::default(), &enricher)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(record.date_taken, Some(taken));
    }
}
