use crate::error::Error;
use crate::guard::DriveGuard;
use crate::hasher::files_identical;
use crate::index::NdjsonWriter;
use crate::model::{ExecutionReport, MoveOutcome, MoveRecord, MoveResult};
use crate::paths::dir_within_bundle;
use crate::plan::PlanReader;
use crate::platform;
use crate::progress::ProgressReporter;
use chrono::Utc;
use dashmap::DashMap;
use rayon::prelude::*;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Moves handed to the worker pool at a time. Bounds memory on huge plans.
const CHUNK_SIZE: usize = 1024;
const UNDO_UNAVAILABLE: &str = "undo log unavailable";

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub allow_cross_device: bool,
    /// Worker threads; 0 lets rayon decide.
    pub workers: usize,
}

/// Applies a plan. Each move goes `Pending -> Validated -> Moved ->
/// UndoRecorded`, or ends early as skipped or failed; one file's failure
/// never stops the others.
pub struct Executor {
    options: ExecuteOptions,
    pool: rayon::ThreadPool,
    created_dirs: DashMap<PathBuf, ()>,
}

impl Executor {
    pub fn new(options: ExecuteOptions) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("reshelve-move-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("failed to start worker pool: {e}")))?;
        Ok(Self {
            options,
            pool,
            created_dirs: DashMap::new(),
        })
    }

    /// Execute every move in `plan`. Performed moves are inverted into
    /// `undo`, flushed record by record. Blocked moves from the plan's
    /// sidecar are carried into the report.
    ///
    /// Only failures to read the plan or write the undo log are errors. When
    /// the undo log breaks, every later move is failed without touching the
    /// disk and the partial report travels in [`Error::UndoLogFailed`].
    pub fn execute(
        &self,
        plan: &PlanReader,
        undo: Option<NdjsonWriter<MoveRecord>>,
        reporter: &dyn ProgressReporter,
    ) -> Result<ExecutionReport, Error> {
        let started = Instant::now();
        let mut report = ExecutionReport {
            dry_run: self.options.dry_run,
            started_at: Some(Utc::now()),
            ..ExecutionReport::default()
        };
        for blocked in plan.blocked()? {
            report.record(MoveResult {
                record: blocked.record,
                outcome: MoveOutcome::Blocked {
                    reason: blocked.reason,
                },
            });
        }

        let total = plan.manifest()?.map(|m| m.executable).unwrap_or(0);
        reporter.on_apply_start(total);
        if self.options.dry_run {
            info!("Dry run: no files will be touched");
        }

        let report = Mutex::new(report);
        let undo = Mutex::new(undo.map(NdjsonWriter::flush_each_record));
        let undo_error: Mutex<Option<Error>> = Mutex::new(None);
        let undo_broken = AtomicBool::new(false);
        let processed = AtomicUsize::new(0);

        let mut records = plan.records()?;
        loop {
            let chunk: Vec<MoveRecord> = records
                .by_ref()
                .take(CHUNK_SIZE)
                .collect::<Result<_, _>>()?;
            if chunk.is_empty() {
                break;
            }

            self.pool.install(|| {
                chunk.par_iter().for_each(|record| {
                    // The undo log is the only way back; once it breaks
                    // nothing else moves.
                    let outcome = if undo_broken.load(Ordering::SeqCst) {
                        MoveOutcome::failed(UNDO_UNAVAILABLE)
                    } else {
                        match self.process(record) {
                            MoveOutcome::Moved if !self.options.dry_run => {
                                self.record_undo(record, &undo, &undo_error, &undo_broken)
                            }
                            outcome => outcome,
                        }
                    };
                    self.log_outcome(record, &outcome);
                    report
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(MoveResult {
                            record: record.clone(),
                            outcome,
                        });
                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    reporter.on_apply_progress(done, total);
                });
            });
        }

        let mut failure = undo_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let writer = undo.into_inner().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            if let Some(writer) = writer {
                match writer.finish() {
                    Ok(written) => info!("Recorded {} undo entries", written),
                    Err(e) => failure = Some(e),
                }
            }
        }

        let mut report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.finished_at = Some(Utc::now());
        reporter.on_apply_complete(report.moved, report.failed, started.elapsed().as_secs_f64());
        match failure {
            Some(e) => Err(Error::UndoLogFailed {
                reason: e.to_string(),
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }

    /// Append the inverse of a completed move to the undo log. A move that
    /// cannot be recorded is put back so the log always covers every moved
    /// file.
    fn record_undo(
        &self,
        record: &MoveRecord,
        undo: &Mutex<Option<NdjsonWriter<MoveRecord>>>,
        undo_error: &Mutex<Option<Error>>,
        undo_broken: &AtomicBool,
    ) -> MoveOutcome {
        let mut guard = undo.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return MoveOutcome::Moved,
        };
        if !undo_broken.load(Ordering::SeqCst) {
            match writer.write(&record.inverted()) {
                Ok(()) => return MoveOutcome::Moved,
                Err(e) => {
                    error!("Failed to record undo entry, stopping: {}", e);
                    undo_broken.store(true, Ordering::SeqCst);
                    undo_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(e);
                }
            }
        }
        match platform::rename_no_replace(&record.final_destination, &record.source) {
            Ok(()) => MoveOutcome::failed(format!("{UNDO_UNAVAILABLE}, move reverted")),
            Err(e) => {
                error!(
                    "Could not revert {} -> {} without an undo entry: {}",
                    record.final_destination.display(),
                    record.source.display(),
                    e
                );
                MoveOutcome::Moved
            }
        }
    }

    fn log_outcome(&self, record: &MoveRecord, outcome: &MoveOutcome) {
        match outcome {
            MoveOutcome::Moved => debug!(
                "{} {} -> {}",
                if self.options.dry_run { "Would move" } else { "Moved" },
                record.source.display(),
                record.final_destination.display()
            ),
            MoveOutcome::Failed { reason } => {
                warn!("Move failed for {}: {}", record.source.display(), reason)
            }
            MoveOutcome::SkippedIdentical { reason } | MoveOutcome::Blocked { reason } => {
                debug!("Skipped {}: {}", record.source.display(), reason)
            }
        }
    }

    fn process(&self, record: &MoveRecord) -> MoveOutcome {
        if record.is_noop() {
            return MoveOutcome::skipped("already in place");
        }

        // Validate
        let expected_size = match fs::symlink_metadata(&record.source) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return MoveOutcome::failed("source is not a regular file"),
            Err(_) => return MoveOutcome::failed("source missing"),
        };
        let destination = &record.final_destination;
        if fs::symlink_metadata(destination).is_ok() {
            return match files_identical(&record.source, destination) {
                Ok(true) => MoveOutcome::skipped("destination exists and is identical"),
                Ok(false) => MoveOutcome::failed("destination already exists"),
                Err(e) => MoveOutcome::failed(format!("cannot compare with destination: {e}")),
            };
        }
        let parent = match destination.parent() {
            Some(parent) => parent,
            None => return MoveOutcome::failed("destination has no parent directory"),
        };

        if self.options.dry_run {
            return match platform::nearest_existing_ancestor(parent) {
                Some(anchor) if anchor.is_dir() => MoveOutcome::Moved,
                _ => MoveOutcome::failed("destination parent is not creatable"),
            };
        }

        if let Err(e) = self.ensure_dir(parent) {
            return MoveOutcome::failed(format!("cannot create {}: {}", parent.display(), e));
        }

        // Move
        if let Err(e) = platform::rename_no_replace(&record.source, destination) {
            if e.kind() == io::ErrorKind::AlreadyExists {
                return MoveOutcome::failed("destination already exists");
            }
            if !platform::is_cross_device_error(&e) {
                return MoveOutcome::failed(format!("move failed: {e}"));
            }
            if !self.options.allow_cross_device {
                return MoveOutcome::failed("CrossDeviceBlocked: rename crossed devices");
            }
            if let Err(reason) = copy_then_remove(&record.source, destination, expected_size) {
                return MoveOutcome::failed(reason);
            }
        }

        // Verify
        match fs::metadata(destination) {
            Ok(meta) if meta.len() == expected_size => MoveOutcome::Moved,
            Ok(meta) => MoveOutcome::failed(format!(
                "size mismatch after move: expected {}, found {}",
                expected_size,
                meta.len()
            )),
            Err(e) => MoveOutcome::failed(format!("destination unreadable after move: {e}")),
        }
    }

    fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        if self.created_dirs.contains_key(dir) {
            return Ok(());
        }
        fs::create_dir_all(dir)?;
        self.created_dirs.insert(dir.to_path_buf(), ());
        Ok(())
    }
}

fn copy_then_remove(source: &Path, destination: &Path, expected_size: u64) -> Result<(), String> {
    let copied = File::open(source).and_then(|mut from| {
        let mut to = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(destination)?;
        let copied = io::copy(&mut from, &mut to)?;
        to.sync_all()?;
        Ok(copied)
    });
    match copied {
        Ok(copied) if copied == expected_size => {}
        Ok(copied) => {
            let _ = fs::remove_file(destination);
            return Err(format!(
                "short copy across devices: {copied} of {expected_size} bytes"
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err("destination already exists".to_string());
        }
        Err(e) => {
            let _ = fs::remove_file(destination);
            return Err(format!("copy across devices failed: {e}"));
        }
    }
    if let Ok(meta) = fs::metadata(source) {
        let _ = fs::set_permissions(destination, meta.permissions());
    }
    fs::remove_file(source)
        .map_err(|e| format!("copied, but could not remove source: {e}"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// Remove empty directories under `root`, deepest first, so parents emptied
/// by the pass are removed too. The root itself and anything inside a bundle
/// is kept. Running it again right after removes nothing.
pub fn cleanup_empty_dirs(root: &Path) -> Result<CleanupReport, Error> {
    let root = DriveGuard::check_root(root)?;
    let mut report = CleanupReport::default();

    for entry in WalkDir::new(&root).contents_first(true).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cleanup cannot read entry: {}", e);
                continue;
            }
        };
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        if dir_within_bundle(&root, dir) {
            continue;
        }
        let empty = match fs::read_dir(dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) => {
                warn!("Cleanup cannot list {}: {}", dir.display(), e);
                continue;
            }
        };
        if !empty {
            continue;
        }
        match fs::remove_dir(dir) {
            Ok(()) => {
                debug!("Removed empty directory {}", dir.display());
                report.removed += 1;
            }
            Err(e) => {
                warn!("Could not remove {}: {}", dir.display(), e);
                report.failed += 1;
            }
        }
    }

    info!("Cleanup removed {} empty directories", report.removed);
    Ok(report)
}
