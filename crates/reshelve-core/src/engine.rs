use crate::advisor::{consult_with_retries, parse_rule_set, AdvisorRequest, RuleAdvisor};
use crate::cluster::{ClusterDetector, ClusterIndex};
use crate::compiler::{DirectCompiler, RuleCompiler};
use crate::config::AppConfig;
use crate::error::Error;
use crate::executor::{cleanup_empty_dirs, ExecuteOptions, Executor};
use crate::guard::DriveGuard;
use crate::index::{MetadataReader, MetadataWriter, NdjsonWriter, Records};
use crate::model::{ExecutionReport, FileRecord, MoveRecord};
use crate::paths::{self, sidecar_path};
use crate::plan::{self, PlanBuilder, PlanManifest, PlanMode, PlanReader, PlanWriter};
use crate::progress::ProgressReporter;
use crate::resolver::{CollisionResolver, DiskCheck};
use crate::rules::{Rule, RuleSet};
use crate::scanner::{self, DateEnricher, ScanOptions};
use crate::summary::{MetadataSummary, SummaryBuilder};
use ahash::AHashSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SUMMARY_SUFFIX: &str = "summary.json";
const SKIPPED_SUFFIX: &str = "skipped.ndjson";

pub struct ReshelveEngine {
    config: AppConfig,
}

#[derive(Debug)]
pub struct ScanResult {
    pub root: PathBuf,
    pub metadata_path: PathBuf,
    pub summary_path: PathBuf,
    pub skipped_path: PathBuf,
    pub scan_duration: Duration,
    pub cluster_duration: Duration,
    pub total_files: usize,
    pub total_bytes: u64,
    pub skipped: usize,
    pub filtered: usize,
    pub clusters: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Defaults to the scanned root.
    pub destination_root: Option<PathBuf>,
    pub allow_cross_device: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub allow_cross_device: bool,
    /// Defaults to `<plan>.undo.ndjson`.
    pub undo_path: Option<PathBuf>,
    pub cleanup: bool,
    /// Tree to check and clean up; overrides the manifest's root.
    pub root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ApplyResult {
    pub report: ExecutionReport,
    pub undo_path: Option<PathBuf>,
    pub duration: Duration,
}

pub fn summary_path(metadata_path: &Path) -> PathBuf {
    sidecar_path(metadata_path, SUMMARY_SUFFIX)
}

/// The metadata stream and its sidecars.
pub fn metadata_artifacts(metadata_path: &Path) -> Vec<PathBuf> {
    vec![
        metadata_path.to_path_buf(),
        summary_path(metadata_path),
        sidecar_path(metadata_path, SKIPPED_SUFFIX),
    ]
}

pub fn load_summary(metadata_path: &Path) -> Result<MetadataSummary, Error> {
    let text = fs::read_to_string(summary_path(metadata_path))?;
    Ok(serde_json::from_str(&text)?)
}

impl ReshelveEngine {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Scan `root` into `metadata_path` and write the summary and skip-log
    /// sidecars. The tree is walked once; clustering re-reads the index.
    pub fn scan(
        &self,
        root: &Path,
        metadata_path: &Path,
        enricher: &dyn DateEnricher,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanResult, Error> {
        self.scan_excluding(root, metadata_path, &[], enricher, reporter)
    }

    /// Like [`scan`](Self::scan), also leaving `exclude` out of the index.
    /// The metadata stream and its sidecars are always excluded.
    pub fn scan_excluding(
        &self,
        root: &Path,
        metadata_path: &Path,
        exclude: &[PathBuf],
        enricher: &dyn DateEnricher,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanResult, Error> {
        let options = ScanOptions::from_config(&self.config)
            .excluding(metadata_artifacts(metadata_path).iter().chain(exclude));
        let scan = scanner::scan(root, options, enricher)?;
        let root = scan.root().to_path_buf();
        info!("Scanning {}", root.display());

        if let Some(parent) = metadata_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let skipped_path = sidecar_path(metadata_path, SKIPPED_SUFFIX);
        let mut scan = scan.with_skip_log(BufWriter::new(File::create(&skipped_path)?));

        // Phase 1: Walk and index
        reporter.on_scan_start();
        let scan_start = Instant::now();
        let mut writer = MetadataWriter::create(metadata_path)?;
        let mut summary = SummaryBuilder::new(&root.display().to_string(), self.config.summary.clone());
        let mut total_bytes = 0u64;
        for record in scan.by_ref() {
            summary.observe(&record);
            total_bytes += record.size_bytes;
            writer.write(&record)?;
            if writer.written() % 1000 == 0 {
                reporter.on_scan_progress(writer.written(), &record.relative_path);
            }
        }
        let (skipped, filtered) = (scan.skipped(), scan.filtered());
        drop(scan);
        let total_files = writer.finish()?;
        let scan_duration = scan_start.elapsed();
        reporter.on_scan_complete(total_files, scan_duration.as_secs_f64());
        debug!(
            "Scan completed in {:.2}s: {} files, {} bytes, {} skipped, {} filtered",
            scan_duration.as_secs_f64(),
            total_files,
            total_bytes,
            skipped,
            filtered
        );

        // Phase 2: Clusters
        let cluster_start = Instant::now();
        let clusters = self.detect_clusters(metadata_path)?;
        let cluster_duration = cluster_start.elapsed();
        reporter.on_cluster_complete(clusters.clusters().len(), cluster_duration.as_secs_f64());

        let summary = summary.finish(clusters.summaries());
        let summary_path = summary_path(metadata_path);
        fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

        Ok(ScanResult {
            root,
            metadata_path: metadata_path.to_path_buf(),
            summary_path,
            skipped_path,
            scan_duration,
            cluster_duration,
            total_files,
            total_bytes,
            skipped,
            filtered,
            clusters: clusters.clusters().len(),
        })
    }

    pub fn detect_clusters(&self, metadata_path: &Path) -> Result<ClusterIndex, Error> {
        let reader = MetadataReader::open(metadata_path)?;
        ClusterDetector::new(self.config.cluster.clone()).detect(|| reader.records())
    }

    /// Ask `advisor` for a rule set. An advisor that never produces usable
    /// rules leaves only the catch-all.
    pub fn design_rules(
        &self,
        metadata_path: &Path,
        advisor: &dyn RuleAdvisor,
    ) -> Result<Vec<Rule>, Error> {
        let summary = load_summary(metadata_path)?;
        let request = AdvisorRequest::Rules {
            summary: &summary,
            catch_all_template: &self.config.catch_all_template,
        };
        match consult_with_retries(advisor, &request, self.config.advisor.retries, parse_rule_set) {
            Ok(rules) => {
                info!("Advisor '{}' proposed {} rules", advisor.name(), rules.len());
                Ok(rules)
            }
            Err(e) => {
                warn!("No usable rules from '{}', everything goes to the catch-all: {}", advisor.name(), e);
                Ok(Vec::new())
            }
        }
    }

    /// Compile `rules` over the metadata index into a plan at `out`.
    pub fn plan_rules(
        &self,
        metadata_path: &Path,
        rules: Vec<Rule>,
        out: &Path,
        options: &PlanOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<PlanManifest, Error> {
        let (root, destination_root) = self.plan_roots(metadata_path, options)?;
        let clusters = self.detect_clusters(metadata_path)?;

        let rule_set = RuleSet::new(rules, &self.config.catch_all_template);
        for entry in rule_set.entries() {
            info!("{}", entry);
        }
        let compiler = RuleCompiler::new(&rule_set, &clusters, &destination_root);

        let mut manifest = PlanManifest::new(&root, &destination_root, PlanMode::Rules);
        manifest.rules_fingerprint = Some(format!("{:016x}", rule_set.fingerprint()));

        let outputs = output_artifacts(metadata_path, out);
        let started = Instant::now();
        reporter.on_plan_start();
        let mut stream = RecordStream::open(metadata_path)?;
        let built = self.plan_builder(&destination_root, options, manifest).build(
            with_plan_progress(
                keep_outputs_in_place(compiler.compile(stream.by_ref()), &outputs),
                reporter,
            ),
            PlanWriter::create(out)?,
        );
        stream.finish()?;
        let mut manifest = built?;
        manifest.template_errors = compiler.template_errors();
        if compiler.bundle_protected() > 0 {
            info!("{} files inside bundles stay in place", compiler.bundle_protected());
        }
        manifest.save(out)?;
        reporter.on_plan_complete(
            manifest.executable,
            manifest.blocked,
            started.elapsed().as_secs_f64(),
        );
        Ok(manifest)
    }

    /// Let the advisor place each file, in batches, into a plan at `out`.
    pub fn plan_direct(
        &self,
        metadata_path: &Path,
        advisor: &dyn RuleAdvisor,
        out: &Path,
        options: &PlanOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<PlanManifest, Error> {
        let (root, destination_root) = self.plan_roots(metadata_path, options)?;
        let clusters = self.detect_clusters(metadata_path)?;
        let fallback = RuleSet::new(Vec::new(), &self.config.catch_all_template);
        let compiler = DirectCompiler::new(
            advisor,
            &fallback,
            &clusters,
            &destination_root,
            self.config.advisor.clone(),
        );

        let manifest = PlanManifest::new(&root, &destination_root, PlanMode::Direct);
        let outputs = output_artifacts(metadata_path, out);
        let started = Instant::now();
        reporter.on_plan_start();
        let mut stream = RecordStream::open(metadata_path)?;
        let built = self.plan_builder(&destination_root, options, manifest).build(
            with_plan_progress(
                keep_outputs_in_place(compiler.compile(stream.by_ref()), &outputs),
                reporter,
            ),
            PlanWriter::create(out)?,
        );
        stream.finish()?;
        let manifest = built?;
        if compiler.fallbacks() > 0 {
            warn!("{} files were placed by the catch-all", compiler.fallbacks());
        }
        manifest.save(out)?;
        reporter.on_plan_complete(
            manifest.executable,
            manifest.blocked,
            started.elapsed().as_secs_f64(),
        );
        Ok(manifest)
    }

    fn plan_roots(
        &self,
        metadata_path: &Path,
        options: &PlanOptions,
    ) -> Result<(PathBuf, PathBuf), Error> {
        let summary = load_summary(metadata_path)?;
        let root = DriveGuard::check_root(Path::new(&summary.root))?;
        let destination_root = match &options.destination_root {
            Some(dest) => {
                fs::create_dir_all(dest)?;
                DriveGuard::check_root(dest)?
            }
            None => root.clone(),
        };
        Ok((root, destination_root))
    }

    fn plan_builder(
        &self,
        destination_root: &Path,
        options: &PlanOptions,
        manifest: PlanManifest,
    ) -> PlanBuilder {
        let resolver = CollisionResolver::new(destination_root, self.config.case_insensitive)
            .with_existence_check(DiskCheck);
        let guard = DriveGuard::new(options.allow_cross_device || self.config.allow_cross_device);
        PlanBuilder::new(resolver, guard, manifest)
    }

    /// Execute a plan, write its undo plan, and clean up emptied directories.
    pub fn apply(
        &self,
        plan_path: &Path,
        options: &ApplyOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<ApplyResult, Error> {
        let started = Instant::now();
        let plan = PlanReader::open(plan_path)?;
        let manifest = plan.manifest()?;
        let root = match (&options.root, &manifest) {
            (Some(root), _) => Some(DriveGuard::check_root(root)?),
            (None, Some(manifest)) => Some(DriveGuard::check_root(&manifest.root)?),
            (None, None) => None,
        };

        let executor = Executor::new(ExecuteOptions {
            dry_run: options.dry_run,
            allow_cross_device: options.allow_cross_device || self.config.allow_cross_device,
            workers: self.config.workers,
        })?;

        let undo_path = if options.dry_run {
            None
        } else {
            Some(
                options
                    .undo_path
                    .clone()
                    .unwrap_or_else(|| plan::undo_path(plan_path)),
            )
        };
        let undo = undo_path
            .as_deref()
            .map(NdjsonWriter::<MoveRecord>::create)
            .transpose()?;

        let mut report = executor.execute(&plan, undo, reporter)?;

        if let Some(undo_path) = &undo_path {
            let roots = match (&manifest, &root) {
                (Some(manifest), _) => Some((manifest.destination_root.clone(), manifest.root.clone())),
                (None, Some(root)) => Some((root.clone(), root.clone())),
                (None, None) => None,
            };
            if let Some((undo_root, undo_destination)) = roots {
                let mut undo_manifest =
                    PlanManifest::new(&undo_root, &undo_destination, PlanMode::Undo);
                undo_manifest.total_records = report.moved;
                undo_manifest.executable = report.moved;
                undo_manifest.save(undo_path)?;
            }
        }

        if options.cleanup && !options.dry_run {
            match &root {
                Some(root) => {
                    let cleanup = cleanup_empty_dirs(root)?;
                    report.cleaned_directories = cleanup.removed;
                    reporter.on_cleanup_complete(cleanup.removed);
                }
                None => warn!("Plan has no manifest and no root was given; skipping cleanup"),
            }
        }

        Ok(ApplyResult {
            report,
            undo_path,
            duration: started.elapsed(),
        })
    }

    /// Write the inverse of an existing plan without executing anything.
    pub fn invert_plan(&self, plan_path: &Path, out: &Path) -> Result<usize, Error> {
        let plan = PlanReader::open(plan_path)?;
        let written = plan::invert(&plan, out)?;
        if let Some(manifest) = plan.manifest()? {
            let mut inverted =
                PlanManifest::new(&manifest.destination_root, &manifest.root, PlanMode::Undo);
            inverted.total_records = written;
            inverted.executable = written;
            inverted.save(out)?;
        }
        Ok(written)
    }
}

/// Metadata records for a plan build. A read error ends the stream and is
/// handed back by [`RecordStream::finish`], so a truncated index never
/// produces a silently partial plan.
struct RecordStream {
    records: Records<FileRecord>,
    error: Option<Error>,
}

impl RecordStream {
    fn open(metadata_path: &Path) -> Result<Self, Error> {
        Ok(Self {
            records: MetadataReader::open(metadata_path)?.records()?,
            error: None,
        })
    }

    fn finish(self) -> Result<(), Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for RecordStream {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        if self.error.is_some() {
            return None;
        }
        match self.records.next()? {
            Ok(record) => Some(record),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

/// Rule id for the tool's own artifacts found inside the scanned tree.
pub const OUTPUT_PROTECTED_RULE: &str = "output-protected";

fn output_artifacts(metadata_path: &Path, plan_path: &Path) -> AHashSet<PathBuf> {
    metadata_artifacts(metadata_path)
        .iter()
        .chain(plan::artifact_paths(plan_path).iter())
        .map(|p| paths::absolutize(p))
        .collect()
}

/// An index written by an earlier run may list this run's outputs; those
/// files stay where they are.
fn keep_outputs_in_place<'a, I>(
    moves: I,
    outputs: &'a AHashSet<PathBuf>,
) -> impl Iterator<Item = MoveRecord> + 'a
where
    I: Iterator<Item = MoveRecord> + 'a,
{
    moves.map(move |planned| {
        if !outputs.contains(&planned.source) {
            return planned;
        }
        debug!("Keeping output artifact {} in place", planned.source.display());
        MoveRecord {
            destination: planned.source.clone(),
            final_destination: planned.source.clone(),
            rule: OUTPUT_PROTECTED_RULE.to_string(),
            source: planned.source,
        }
    })
}

fn with_plan_progress<'a, I>(
    moves: I,
    reporter: &'a dyn ProgressReporter,
) -> impl Iterator<Item = MoveRecord> + 'a
where
    I: Iterator<Item = MoveRecord> + 'a,
{
    let mut planned = 0usize;
    moves.inspect(move |_| {
        planned += 1;
        if planned % 10_000 == 0 {
            reporter.on_plan_progress(planned);
        }
    })
}
