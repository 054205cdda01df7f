//! Event detection.
//!
//! Two strategies run over the metadata stream:
//! - name-based: files sharing a base-name stem once sequence numbers and
//!   date tokens are stripped (`Trip_001.jpg`, `Trip_002.jpg` -> `Trip`)
//! - time-based: remaining files whose effective timestamps follow each
//!   other with no gap larger than the configured threshold
//!
//! Name clusters take precedence. Clusters below the minimum size are dropped
//! and their files stay unclustered. Memory is proportional to the number of
//! distinct stems and distinct timestamps, not to the number of files.

use crate::config::ClusterConfig;
use crate::error::Error;
use crate::model::FileRecord;
use ahash::AHashMap;
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

lazy_static::lazy_static! {
    static ref DATE_TOKEN: Regex =
        Regex::new(r"(19|20)\d{2}[-_.]?(0[1-9]|1[0-2])[-_.]?(0[1-9]|[12]\d|3[01])([T _-]?\d{4,6})?")
            .unwrap();
    static ref SEQUENCE_SUFFIX: Regex = Regex::new(r"[\d\s_\-.()]+$").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"[\s_\-.]+").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterKind {
    Name { stem: String },
    Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: ClusterKind,
    pub count: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_files: Vec<String>,
}

/// What the rule-design advisor sees for each cluster.
pub type ClusterSummary = Cluster;

/// Base-name stem used for name clustering, lowercased for grouping.
/// `None` when too little meaningful text is left.
pub fn name_stem(file_name: &str, min_len: usize) -> Option<(String, String)> {
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };
    let without_dates = DATE_TOKEN.replace_all(stem, " ");
    let trimmed = SEQUENCE_SUFFIX.replace(without_dates.trim(), "");
    let label = SEPARATORS.replace_all(trimmed.trim(), " ").trim().to_string();
    if label.chars().filter(|c| c.is_alphanumeric()).count() < min_len {
        return None;
    }
    Some((label.to_lowercase(), label))
}

struct NameGroup {
    label: String,
    count: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    samples: Vec<String>,
}

pub struct ClusterDetector {
    config: ClusterConfig,
}

impl ClusterDetector {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Run detection. `open` is called once per pass and must yield the same
    /// stream each time (e.g. [`crate::index::MetadataReader::records`]).
    pub fn detect<F, I>(&self, mut open: F) -> Result<ClusterIndex, Error>
    where
        F: FnMut() -> Result<I, Error>,
        I: Iterator<Item = Result<FileRecord, Error>>,
    {
        let min_size = self.config.min_cluster_size.max(1) as u64;

        // Pass 1: stems.
        let mut groups: AHashMap<String, NameGroup> = AHashMap::new();
        for record in open()? {
            let record = record?;
            let Some((key, label)) = name_stem(record.file_name(), self.config.min_stem_len)
            else {
                continue;
            };
            let t = record.effective_time();
            let group = groups.entry(key).or_insert_with(|| NameGroup {
                label,
                count: 0,
                start: t,
                end: t,
                samples: Vec::new(),
            });
            group.count += 1;
            group.start = group.start.min(t);
            group.end = group.end.max(t);
            if group.samples.len() < self.config.sample_files {
                group.samples.push(record.relative_path.clone());
            }
        }

        let mut name_keys: Vec<(String, NameGroup)> = groups
            .into_iter()
            .filter(|(_, g)| g.count >= min_size)
            .collect();
        name_keys.sort_by(|a, b| a.0.cmp(&b.0));

        let mut clusters = Vec::new();
        let mut by_stem = AHashMap::new();
        for (key, group) in name_keys {
            by_stem.insert(key.clone(), clusters.len());
            clusters.push(Cluster {
                id: format!("name:{key}"),
                label: format!("{} - {}", group.start.year(), group.label),
                kind: ClusterKind::Name { stem: key },
                count: group.count,
                start: group.start,
                end: group.end,
                sample_files: group.samples,
            });
        }
        debug!("{} name clusters", clusters.len());

        // Pass 2: timeline of files outside name clusters, keyed by second.
        let mut timeline: BTreeMap<i64, u64> = BTreeMap::new();
        for record in open()? {
            let record = record?;
            if self.stem_cluster(&record, &by_stem).is_some() {
                continue;
            }
            *timeline.entry(record.effective_time().timestamp()).or_default() += 1;
        }

        let gap = self.config.gap_hours.max(0) * 3600;
        let mut spans = Vec::new();
        let mut run: Option<(i64, i64, u64)> = None;
        for (&ts, &n) in &timeline {
            run = match run {
                Some((start, end, count)) if ts - end <= gap => Some((start, ts, count + n)),
                Some(finished) => {
                    spans.push(finished);
                    Some((ts, ts, n))
                }
                None => Some((ts, ts, n)),
            };
        }
        spans.extend(run);

        let mut time_spans = Vec::new();
        for (start, end, count) in spans.into_iter().filter(|s| s.2 >= min_size) {
            let start_dt = DateTime::from_timestamp(start, 0).unwrap_or_default();
            let end_dt = DateTime::from_timestamp(end, 0).unwrap_or_default();
            time_spans.push((start, end, clusters.len()));
            clusters.push(Cluster {
                id: format!("time:{}", start_dt.format("%Y-%m-%dT%H:%M:%S")),
                label: format!("Event_{}", start_dt.format("%Y-%m-%d")),
                kind: ClusterKind::Time,
                count,
                start: start_dt,
                end: end_dt,
                sample_files: Vec::new(),
            });
        }

        let mut index = ClusterIndex {
            clusters,
            by_stem,
            time_spans,
            min_stem_len: self.config.min_stem_len,
        };

        // Pass 3: samples for time clusters.
        if !index.time_spans.is_empty() && self.config.sample_files > 0 {
            for record in open()? {
                let record = record?;
                if let Some(idx) = index.time_cluster(&record) {
                    let samples = &mut index.clusters[idx].sample_files;
                    if samples.len() < self.config.sample_files {
                        samples.push(record.relative_path.clone());
                    }
                }
            }
        }

        info!(
            "Detected {} clusters ({} name, {} time)",
            index.clusters.len(),
            index.by_stem.len(),
            index.time_spans.len()
        );
        Ok(index)
    }

    /// Detection over records already in memory.
    pub fn detect_records(&self, records: &[FileRecord]) -> ClusterIndex {
        let result = self.detect(|| Ok(records.iter().cloned().map(Ok)));
        match result {
            Ok(index) => index,
            // In-memory passes produce no errors.
            Err(_) => ClusterIndex::empty(),
        }
    }

    fn stem_cluster(&self, record: &FileRecord, by_stem: &AHashMap<String, usize>) -> Option<usize> {
        let (key, _) = name_stem(record.file_name(), self.config.min_stem_len)?;
        by_stem.get(&key).copied()
    }
}

/// Detected clusters plus the predicates that assign files to them.
#[derive(Debug, Clone, Default)]
pub struct ClusterIndex {
    clusters: Vec<Cluster>,
    by_stem: AHashMap<String, usize>,
    /// Sorted, non-overlapping `(start, end, cluster index)` in epoch seconds.
    time_spans: Vec<(i64, i64, usize)>,
    min_stem_len: usize,
}

impl ClusterIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.clusters.clone()
    }

    /// Cluster a record belongs to, if any. Pure function of the record.
    pub fn assign(&self, record: &FileRecord) -> Option<&Cluster> {
        if let Some((key, _)) = name_stem(record.file_name(), self.min_stem_len) {
            if let Some(&idx) = self.by_stem.get(&key) {
                return Some(&self.clusters[idx]);
            }
        }
        self.time_cluster(record).map(|idx| &self.clusters[idx])
    }

    /// Copy of `record` with `cluster_id` filled in.
    pub fn annotate(&self, record: &FileRecord) -> FileRecord {
        let mut annotated = record.clone();
        annotated.cluster_id = self.assign(record).map(|c| c.id.clone());
        annotated
    }

    fn time_cluster(&self, record: &FileRecord) -> Option<usize> {
        if self.time_spans.is_empty() {
            return None;
        }
        if let Some((key, _)) = name_stem(record.file_name(), self.min_stem_len) {
            if self.by_stem.contains_key(&key) {
                return None;
            }
        }
        let ts = record.effective_time().timestamp();
        let pos = self.time_spans.partition_point(|&(start, _, _)| start <= ts);
        let (start, end, idx) = *self.time_spans.get(pos.checked_sub(1)?)?;
        (start <= ts && ts <= end).then_some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileCategory;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn record(rel: &str, t: DateTime<Utc>) -> FileRecord {
        FileRecord {
            absolute_path: PathBuf::from("/r").join(rel),
            relative_path: rel.to_string(),
            size_bytes: 1,
            modified: t,
            created: None,
            extension: "jpg".to_string(),
            category: FileCategory::Photos,
            device_id: None,
            cluster_id: None,
            date_taken: None,
        }
    }

    fn config(min: usize) -> ClusterConfig {
        ClusterConfig {
            min_cluster_size: min,
            gap_hours: 24,
            min_stem_len: 4,
            sample_files: 2,
        }
    }

    #[test]
    fn test_name_stem_strips_sequences_and_dates() {
        assert_eq!(name_stem("Trip_001.jpg", 4).unwrap().0, "trip");
        assert_eq!(name_stem("Hawaii Trip (2).jpg", 4).unwrap().1, "Hawaii Trip");
        assert_eq!(name_stem("Hawaii_2024-07-01_003.jpg", 4).unwrap().1, "Hawaii");
        assert_eq!(name_stem("wedding-20190612-120102.mov", 4).unwrap().0, "wedding");
        assert!(name_stem("IMG_0001.JPG", 4).is_none());
        assert!(name_stem("20240101.jpg", 4).is_none());
    }

    #[test]
    fn test_name_clusters_respect_minimum() {
        let t = Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap();
        let mut records: Vec<FileRecord> = (0..3)
            .map(|i| record(&format!("a/Trip_{i:03}.jpg"), t + Duration::days(i * 30)))
            .collect();
        records.push(record("b/Party_1.jpg", t));

        let index = ClusterDetector::new(config(3)).detect_records(&records);
        assert_eq!(index.clusters().len(), 1);
        let trip = &index.clusters()[0];
        assert_eq!(trip.id, "name:trip");
        assert_eq!(trip.label, "2024 - Trip");
        assert_eq!(trip.count, 3);
        assert_eq!(trip.sample_files.len(), 2);
        assert_eq!(index.assign(&records[1]).unwrap().id, "name:trip");
        assert!(index.assign(&records[3]).is_none());
    }

    #[test]
    fn test_time_clusters_split_on_gap() {
        let t = Utc.with_ymd_and_hms(2023, 12, 24, 9, 0, 0).unwrap();
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(record(&format!("x/IMG_{i}.jpg"), t + Duration::hours(i * 5)));
        }
        // 48h later: a second burst.
        for i in 0..4 {
            records.push(record(
                &format!("y/DSC_{i}.jpg"),
                t + Duration::hours(15 + 48 + i),
            ));
        }
        // Isolated straggler.
        records.push(record("z/IMG_99.jpg", t + Duration::days(30)));

        let index = ClusterDetector::new(config(3)).detect_records(&records);
        let ids: Vec<&str> = index.clusters().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["time:2023-12-24T09:00:00", "time:2023-12-26T12:00:00"]);
        assert_eq!(index.clusters()[0].label, "Event_2023-12-24");
        assert_eq!(index.clusters()[0].count, 4);
        assert_eq!(index.clusters()[0].sample_files.len(), 2);
        assert_eq!(
            index.assign(&records[5]).unwrap().id,
            "time:2023-12-26T12:00:00"
        );
        assert!(index.assign(&records[8]).is_none());
    }

    #[test]
    fn test_assignment_is_deterministic_regardless_of_ties() {
        let t = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let records: Vec<FileRecord> = (0..5)
            .map(|i| record(&format!("d/IMG_{i}.jpg"), t))
            .collect();
        let mut reversed = records.clone();
        reversed.reverse();

        let a = ClusterDetector::new(config(5)).detect_records(&records);
        let b = ClusterDetector::new(config(5)).detect_records(&reversed);
        assert_eq!(a.clusters().len(), 1);
        for r in &records {
            assert_eq!(a.annotate(r).cluster_id, b.annotate(r).cluster_id);
        }
    }
}
