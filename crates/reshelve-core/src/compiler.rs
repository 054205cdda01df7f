use crate::advisor::{consult_with_retries, parse_decisions, AdvisorRequest, FileBrief, RuleAdvisor};
use crate::cluster::ClusterIndex;
use crate::config::AdvisorConfig;
use crate::model::{FileRecord, MoveRecord};
use crate::paths::{self, join_relative};
use crate::rules::{finalize_destination, RuleSet};
use ahash::AHashMap;
use std::cell::Cell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rule id for files inside a bundle, which always stay where they are.
pub const BUNDLE_PROTECTED_RULE: &str = "bundle-protected";
/// Rule id for destinations chosen per file by the advisor.
pub const ADVISOR_RULE: &str = "advisor";

fn keep_in_place(record: &FileRecord) -> MoveRecord {
    MoveRecord {
        source: record.absolute_path.clone(),
        destination: record.absolute_path.clone(),
        final_destination: record.absolute_path.clone(),
        rule: BUNDLE_PROTECTED_RULE.to_string(),
    }
}

fn planned(record: &FileRecord, destination_root: &Path, relative: &str, rule: &str) -> MoveRecord {
    let destination = join_relative(destination_root, relative);
    MoveRecord {
        source: record.absolute_path.clone(),
        destination: destination.clone(),
        final_destination: destination,
        rule: rule.to_string(),
    }
}

/// Maps every file record to exactly one move using a [`RuleSet`].
///
/// Compilation is a pure function of the record, the rules and the cluster
/// index. Final destinations are left equal to the rule's destination; the
/// collision resolver assigns them afterwards.
pub struct RuleCompiler<'a> {
    rules: &'a RuleSet,
    clusters: &'a ClusterIndex,
    destination_root: PathBuf,
    template_errors: Cell<usize>,
    bundle_protected: Cell<usize>,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(rules: &'a RuleSet, clusters: &'a ClusterIndex, destination_root: &Path) -> Self {
        Self {
            rules,
            clusters,
            destination_root: destination_root.to_path_buf(),
            template_errors: Cell::new(0),
            bundle_protected: Cell::new(0),
        }
    }

    pub fn compile_record(&self, record: &FileRecord) -> MoveRecord {
        if paths::path_contains_bundle(&record.relative_path) {
            self.bundle_protected.set(self.bundle_protected.get() + 1);
            return keep_in_place(record);
        }
        let cluster = self.clusters.assign(record);
        let matched = self.rules.evaluate(record, cluster);
        if matched.template_error.is_some() {
            self.template_errors.set(self.template_errors.get() + 1);
        }
        planned(
            record,
            &self.destination_root,
            &matched.relative_destination,
            &matched.rule_id,
        )
    }

    /// Lazily compile a record stream, one move per record.
    pub fn compile<I>(&self, records: I) -> Compiled<'_, 'a, I::IntoIter>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        Compiled {
            compiler: self,
            records: records.into_iter(),
        }
    }

    /// Records that fell through to the catch-all because of a broken template.
    pub fn template_errors(&self) -> usize {
        self.template_errors.get()
    }

    pub fn bundle_protected(&self) -> usize {
        self.bundle_protected.get()
    }
}

pub struct Compiled<'c, 'a, I> {
    compiler: &'c RuleCompiler<'a>,
    records: I,
}

impl<I: Iterator<Item = FileRecord>> Iterator for Compiled<'_, '_, I> {
    type Item = MoveRecord;

    fn next(&mut self) -> Option<MoveRecord> {
        let record = self.records.next()?;
        Some(self.compiler.compile_record(&record))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

/// Asks the advisor for a destination per file, in bounded batches.
///
/// Files the advisor skips, or whose destination is unusable, go through the
/// fallback rule set (normally just the catch-all). A batch whose response
/// cannot be repaired after the configured retries falls back as a whole.
pub struct DirectCompiler<'a> {
    advisor: &'a dyn RuleAdvisor,
    fallback: &'a RuleSet,
    clusters: &'a ClusterIndex,
    root_label: String,
    destination_root: PathBuf,
    config: AdvisorConfig,
    batches: Cell<usize>,
    fallbacks: Cell<usize>,
}

impl<'a> DirectCompiler<'a> {
    pub fn new(
        advisor: &'a dyn RuleAdvisor,
        fallback: &'a RuleSet,
        clusters: &'a ClusterIndex,
        destination_root: &Path,
        config: AdvisorConfig,
    ) -> Self {
        Self {
            advisor,
            fallback,
            clusters,
            root_label: destination_root.display().to_string(),
            destination_root: destination_root.to_path_buf(),
            config,
            batches: Cell::new(0),
            fallbacks: Cell::new(0),
        }
    }

    pub fn batches(&self) -> usize {
        self.batches.get()
    }

    /// Records routed to the fallback rule set.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks.get()
    }

    pub fn compile_batch(&self, batch: &[FileRecord]) -> Vec<MoveRecord> {
        if self.batches.get() > 0 && self.config.delay_secs > 0.0 {
            thread::sleep(Duration::from_secs_f64(self.config.delay_secs));
        }
        self.batches.set(self.batches.get() + 1);

        let files: Vec<FileBrief> = batch
            .iter()
            .filter(|r| !paths::path_contains_bundle(&r.relative_path))
            .map(|r| FileBrief::new(r, self.clusters.assign(r).map(|c| c.id.as_str())))
            .collect();

        let decisions = if files.is_empty() {
            AHashMap::new()
        } else {
            let count = files.len();
            let request = AdvisorRequest::Direct {
                root: &self.root_label,
                files,
            };
            match consult_with_retries(
                self.advisor,
                &request,
                self.config.retries,
                parse_decisions,
            ) {
                Ok(decisions) => {
                    debug!("Advisor placed {} of {} files", decisions.len(), count);
                    decisions
                }
                Err(e) => {
                    warn!(
                        "Advisor gave no usable answer for a batch of {} files, using the catch-all: {}",
                        count, e
                    );
                    AHashMap::new()
                }
            }
        };

        batch
            .iter()
            .map(|record| self.decide(record, &decisions))
            .collect()
    }

    fn decide(&self, record: &FileRecord, decisions: &AHashMap<String, String>) -> MoveRecord {
        if paths::path_contains_bundle(&record.relative_path) {
            return keep_in_place(record);
        }
        if let Some(raw) = decisions.get(&record.relative_path) {
            match finalize_destination(raw, record.file_name()) {
                Ok(relative) => {
                    return planned(record, &self.destination_root, &relative, ADVISOR_RULE)
                }
                Err(reason) => warn!(
                    "Rejecting advisor destination '{}' for {}: {}",
                    raw, record.relative_path, reason
                ),
            }
        }
        self.fallbacks.set(self.fallbacks.get() + 1);
        let cluster = self.clusters.assign(record);
        let matched = self.fallback.evaluate(record, cluster);
        planned(
            record,
            &self.destination_root,
            &matched.relative_destination,
            &matched.rule_id,
        )
    }

    /// Lazily compile a record stream. At most one batch is buffered.
    pub fn compile<I>(&self, records: I) -> DirectCompiled<'_, 'a, I::IntoIter>
    where
        I: IntoIterator<Item = FileRecord>,
    {
        DirectCompiled {
            compiler: self,
            records: records.into_iter(),
            pending: VecDeque::new(),
        }
    }
}

pub struct DirectCompiled<'c, 'a, I> {
    compiler: &'c DirectCompiler<'a>,
    records: I,
    pending: VecDeque<MoveRecord>,
}

impl<I: Iterator<Item = FileRecord>> Iterator for DirectCompiled<'_, '_, I> {
    type Item = MoveRecord;

    fn next(&mut self) -> Option<MoveRecord> {
        if self.pending.is_empty() {
            let size = self.compiler.config.batch_size.max(1);
            let batch: Vec<FileRecord> = self.records.by_ref().take(size).collect();
            if batch.is_empty() {
                return None;
            }
            info!(
                "Consulting advisor for batch {} ({} files)",
                self.compiler.batches() + 1,
                batch.len()
            );
            self.pending.extend(self.compiler.compile_batch(&batch));
        }
        self.pending.pop_front()
    }
}
