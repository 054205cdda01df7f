use crate::cluster::ClusterSummary;
use crate::config::SummaryConfig;
use crate::hasher::hash_str;
use crate::model::FileRecord;
use ahash::AHashMap;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap};

const ROOT_FILES: &str = "(root files)";
const OTHER_FOLDERS: &str = "(other folders)";
const NO_EXTENSION: &str = "(no extension)";

/// Compact description of a scanned tree, handed to the rule-design advisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSummary {
    pub root: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub extension_histogram: BTreeMap<String, u64>,
    pub extension_sizes: BTreeMap<String, u64>,
    pub year_distribution: BTreeMap<String, u64>,
    pub folders: Vec<FolderSummary>,
    pub sample_paths: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<ClusterSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderSummary {
    pub name: String,
    pub file_count: u64,
    pub total_size_bytes: u64,
    pub extensions: BTreeMap<String, u64>,
    pub sample_paths: Vec<String>,
}

/// Accumulates a [`MetadataSummary`] in one pass. Memory is bounded by the
/// configured sample sizes and folder cap, never by the number of files.
///
/// The global sample keeps the paths with the smallest hashes (bottom-k), so
/// it is uniform over the tree yet identical across runs.
pub struct SummaryBuilder {
    config: SummaryConfig,
    summary: MetadataSummary,
    folders: AHashMap<String, FolderSummary>,
    reservoir: BinaryHeap<(u64, String)>,
}

impl SummaryBuilder {
    pub fn new(root: &str, config: SummaryConfig) -> Self {
        Self {
            config,
            summary: MetadataSummary {
                root: root.to_string(),
                generated_at: Some(Utc::now()),
                ..MetadataSummary::default()
            },
            folders: AHashMap::new(),
            reservoir: BinaryHeap::new(),
        }
    }

    pub fn observe(&mut self, record: &FileRecord) {
        let s = &mut self.summary;
        s.total_files += 1;
        s.total_size_bytes += record.size_bytes;

        let ext_key = if record.extension.is_empty() {
            NO_EXTENSION.to_string()
        } else {
            format!(".{}", record.extension)
        };
        *s.extension_histogram.entry(ext_key.clone()).or_default() += 1;
        *s.extension_sizes.entry(ext_key.clone()).or_default() += record.size_bytes;
        *s.year_distribution
            .entry(record.effective_time().year().to_string())
            .or_default() += 1;

        let top = match record.relative_path.split_once('/') {
            Some((top, _)) => top,
            None => ROOT_FILES,
        };
        let key = if self.folders.contains_key(top) || self.folders.len() < self.config.max_folders
        {
            top
        } else {
            OTHER_FOLDERS
        };
        let folder = self
            .folders
            .entry(key.to_string())
            .or_insert_with(|| FolderSummary {
                name: key.to_string(),
                ..FolderSummary::default()
            });
        folder.file_count += 1;
        folder.total_size_bytes += record.size_bytes;
        *folder.extensions.entry(ext_key).or_default() += 1;
        if folder.sample_paths.len() < self.config.folder_samples {
            folder.sample_paths.push(record.relative_path.clone());
        }

        let priority = hash_str(&record.relative_path);
        if self.reservoir.len() < self.config.sample_size {
            self.reservoir.push((priority, record.relative_path.clone()));
        } else if let Some((largest, _)) = self.reservoir.peek() {
            if priority < *largest {
                self.reservoir.pop();
                self.reservoir.push((priority, record.relative_path.clone()));
            }
        }
    }

    pub fn finish(mut self, clusters: Vec<ClusterSummary>) -> MetadataSummary {
        let mut folders: Vec<FolderSummary> = self.folders.into_values().collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        self.summary.folders = folders;

        let mut sample: Vec<String> = self.reservoir.into_iter().map(|(_, p)| p).collect();
        sample.sort();
        self.summary.sample_paths = sample;
        self.summary.clusters = clusters;
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileCategory;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn record(rel: &str, ext: &str, size: u64, year: i32) -> FileRecord {
        FileRecord {
            absolute_path: PathBuf::from("/r").join(rel),
            relative_path: rel.to_string(),
            size_bytes: size,
            modified: Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
            created: None,
            extension: ext.to_string(),
            category: FileCategory::from_extension(ext),
            device_id: None,
            cluster_id: None,
            date_taken: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let config = SummaryConfig {
            sample_size: 2,
            folder_samples: 1,
            max_folders: 1,
        };
        let mut builder = SummaryBuilder::new("/r", config);
        builder.observe(&record("photos/a.jpg", "jpg", 10, 2020));
        builder.observe(&record("photos/b.jpg", "jpg", 20, 2021));
        builder.observe(&record("docs/c.pdf", "pdf", 5, 2021));
        builder.observe(&record("README", "", 1, 2021));
        let summary = builder.finish(Vec::new());

        assert_eq!(summary.total_files, 4);
        assert_eq!(summary.total_size_bytes, 36);
        assert_eq!(summary.extension_histogram[".jpg"], 2);
        assert_eq!(summary.extension_sizes[".jpg"], 30);
        assert_eq!(summary.extension_histogram[NO_EXTENSION], 1);
        assert_eq!(summary.year_distribution["2021"], 3);
        assert_eq!(summary.sample_paths.len(), 2);

        let names: Vec<&str> = summary.folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![OTHER_FOLDERS, "photos"]);
        let photos = summary.folders.iter().find(|f| f.name == "photos").unwrap();
        assert_eq!(photos.file_count, 2);
        assert_eq!(photos.sample_paths.len(), 1);
    }

    #[test]
    fn test_sample_is_deterministic() {
        let run = || {
            let mut builder = SummaryBuilder::new("/r", SummaryConfig {
                sample_size: 3,
                ..SummaryConfig::default()
            });
            for i in 0..50 {
                builder.observe(&record(&format!("f/{i}.txt"), "txt", 1, 2020));
            }
            builder.finish(Vec::new()).sample_paths
        };
        assert_eq!(run(), run());
    }
}
