use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

use reshelve_core::advisor::{parse_rule_set, FileAdvisor};
use reshelve_core::executor::cleanup_empty_dirs;
use reshelve_core::guard::DriveGuard;
use reshelve_core::model::{MoveOutcome, MoveRecord};
use reshelve_core::plan::{self, PlanBuilder, PlanManifest, PlanMode, PlanReader, PlanWriter};
use reshelve_core::resolver::CollisionResolver;
use reshelve_core::rules::Rule;
use reshelve_core::scanner::NoEnrichment;
use reshelve_core::{AppConfig, ApplyOptions, Error, PlanOptions, ReshelveEngine, SilentReporter};

/// Layout:
///   tree/
///     x/a.jpg
///     y/a.jpg              <- same name, different folder
///     y/b.jpg
///     docs/report.pdf      <- matched by no rule
///     Lib.photoslibrary/inside.jpg
struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    work: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempdir().unwrap();
        let tree = tmp.path().join("tree");
        let work = tmp.path().join("work");
        for dir in ["x", "y", "docs", "Lib.photoslibrary"] {
            fs::create_dir_all(tree.join(dir)).unwrap();
        }
        fs::create_dir_all(&work).unwrap();
        fs::write(tree.join("x/a.jpg"), "first a").unwrap();
        fs::write(tree.join("y/a.jpg"), "second a").unwrap();
        fs::write(tree.join("y/b.jpg"), "b").unwrap();
        fs::write(tree.join("docs/report.pdf"), "pdf").unwrap();
        fs::write(tree.join("Lib.photoslibrary/inside.jpg"), "library").unwrap();
        let root = fs::canonicalize(&tree).unwrap();
        Self {
            _tmp: tmp,
            root,
            work,
        }
    }

    fn metadata(&self) -> PathBuf {
        self.work.join("metadata.ndjson")
    }

    fn plan(&self) -> PathBuf {
        self.work.join("plan.ndjson")
    }
}

fn engine() -> ReshelveEngine {
    ReshelveEngine::new(AppConfig {
        case_insensitive: false,
        ..AppConfig::default()
    })
}

fn photo_rules() -> Vec<Rule> {
    parse_rule_set(
        r#"{"rules": [
            {"id": "photos", "name": "Photos", "priority": 10,
             "match": {"ext_in": ["jpg"]},
             "destination_template": "Photos/{original_name}"}
        ]}"#,
    )
    .unwrap()
}

fn read_plan(path: &Path) -> Vec<MoveRecord> {
    PlanReader::open(path)
        .unwrap()
        .records()
        .unwrap()
        .map(Result::unwrap)
        .collect()
}

fn scan_and_plan(fx: &Fixture, engine: &ReshelveEngine, rules: Vec<Rule>) -> Vec<MoveRecord> {
    engine
        .scan(&fx.root, &fx.metadata(), &NoEnrichment, &SilentReporter)
        .unwrap();
    engine
        .plan_rules(
            &fx.metadata(),
            rules,
            &fx.plan(),
            &PlanOptions::default(),
            &SilentReporter,
        )
        .unwrap();
    read_plan(&fx.plan())
}

#[test]
fn test_scan_writes_index_and_sidecars() {
    let fx = Fixture::new();
    let result = engine()
        .scan(&fx.root, &fx.metadata(), &NoEnrichment, &SilentReporter)
        .unwrap();
    assert_eq!(result.total_files, 5);
    assert_eq!(result.root, fx.root);
    assert!(result.summary_path.is_file());
    assert!(result.skipped_path.is_file());

    let summary = reshelve_core::engine::load_summary(&fx.metadata()).unwrap();
    assert_eq!(summary.total_files, 5);
    assert_eq!(summary.extension_histogram.get("jpg"), Some(&4));
}

#[test]
fn test_scan_missing_root_is_fatal() {
    let fx = Fixture::new();
    let err = engine()
        .scan(
            &fx.root.join("gone"),
            &fx.metadata(),
            &NoEnrichment,
            &SilentReporter,
        )
        .unwrap_err();
    assert!(matches!(err, Error::RootNotFound(_)));
    assert!(!fx.metadata().exists());
}

#[test]
fn test_plan_covers_every_record_with_distinct_destinations() {
    let fx = Fixture::new();
    let moves = scan_and_plan(&fx, &engine(), photo_rules());
    assert_eq!(moves.len(), 5);

    let finals: HashSet<&PathBuf> = moves.iter().map(|m| &m.final_destination).collect();
    assert_eq!(finals.len(), moves.len());

    let by_source = |rel: &str| {
        moves
            .iter()
            .find(|m| m.source == fx.root.join(rel))
            .unwrap()
            .clone()
    };
    assert_eq!(by_source("x/a.jpg").final_destination, fx.root.join("Photos/a.jpg"));
    assert_eq!(by_source("y/a.jpg").destination, fx.root.join("Photos/a.jpg"));
    assert_eq!(by_source("y/a.jpg").final_destination, fx.root.join("Photos/a_1.jpg"));
    assert_eq!(by_source("y/b.jpg").final_destination, fx.root.join("Photos/b.jpg"));

    let report = by_source("docs/report.pdf");
    assert_eq!(report.rule, "catch-all");
    assert_eq!(report.final_destination, fx.root.join("Uncategorized/report.pdf"));

    let inside = by_source("Lib.photoslibrary/inside.jpg");
    assert!(inside.is_noop());
    assert_eq!(inside.rule, "bundle-protected");

    let manifest = PlanReader::open(&fx.plan()).unwrap().manifest().unwrap().unwrap();
    assert_eq!(manifest.mode, PlanMode::Rules);
    assert_eq!(manifest.total_records, 5);
    assert_eq!(manifest.executable, 5);
    assert_eq!(manifest.collisions_resolved, 1);
    assert!(manifest.rules_fingerprint.is_some());
}

#[test]
fn test_plan_without_rules_sends_everything_to_catch_all() {
    let fx = Fixture::new();
    let moves = scan_and_plan(&fx, &engine(), Vec::new());
    assert_eq!(moves.len(), 5);
    for m in moves.iter().filter(|m| !m.is_noop()) {
        assert_eq!(m.rule, "catch-all");
        assert!(m.final_destination.starts_with(fx.root.join("Uncategorized")));
    }
}

#[test]
fn test_plan_is_deterministic() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());
    let second = fx.work.join("plan-again.ndjson");
    engine
        .plan_rules(
            &fx.metadata(),
            photo_rules(),
            &second,
            &PlanOptions::default(),
            &SilentReporter,
        )
        .unwrap();
    assert_eq!(fs::read(fx.plan()).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn test_apply_then_undo_restores_the_tree() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());

    let options = ApplyOptions {
        cleanup: true,
        ..ApplyOptions::default()
    };
    let applied = engine.apply(&fx.plan(), &options, &SilentReporter).unwrap();
    assert_eq!(applied.report.moved, 4);
    assert_eq!(applied.report.skipped_identical, 1);
    assert!(!applied.report.has_failures());
    assert!(applied.report.failures.is_empty());

    assert_eq!(fs::read_to_string(fx.root.join("Photos/a.jpg")).unwrap(), "first a");
    assert_eq!(fs::read_to_string(fx.root.join("Photos/a_1.jpg")).unwrap(), "second a");
    assert!(fx.root.join("Uncategorized/report.pdf").is_file());
    assert!(fx.root.join("Lib.photoslibrary/inside.jpg").is_file());
    // Emptied source folders are gone
    assert!(!fx.root.join("x").exists());
    assert!(!fx.root.join("docs").exists());
    assert_eq!(applied.report.cleaned_directories, 3);

    let undo = applied.undo_path.unwrap();
    assert_eq!(undo, plan::undo_path(&fx.plan()));
    let undo_moves = read_plan(&undo);
    assert_eq!(undo_moves.len(), 4);
    assert!(undo_moves.iter().all(|m| m.rule.starts_with("undo:")));

    let restored = engine.apply(&undo, &options, &SilentReporter).unwrap();
    assert_eq!(restored.report.moved, 4);
    assert!(!restored.report.has_failures());
    assert_eq!(fs::read_to_string(fx.root.join("x/a.jpg")).unwrap(), "first a");
    assert_eq!(fs::read_to_string(fx.root.join("y/a.jpg")).unwrap(), "second a");
    assert!(fx.root.join("y/b.jpg").is_file());
    assert!(fx.root.join("docs/report.pdf").is_file());
    assert!(!fx.root.join("Photos").exists());
    assert!(!fx.root.join("Uncategorized").exists());
}

#[test]
fn test_dry_run_reports_missing_source_and_continues() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());
    fs::remove_file(fx.root.join("y/b.jpg")).unwrap();

    let options = ApplyOptions {
        dry_run: true,
        cleanup: true,
        ..ApplyOptions::default()
    };
    let result = engine.apply(&fx.plan(), &options, &SilentReporter).unwrap();
    let report = result.report;
    assert!(report.dry_run);
    assert!(result.undo_path.is_none());
    assert_eq!(report.failed, 1);
    assert_eq!(report.moved, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].record.source, fx.root.join("y/b.jpg"));
    assert_eq!(report.failures[0].outcome, MoveOutcome::failed("source missing"));

    // Nothing was touched
    assert!(fx.root.join("x/a.jpg").is_file());
    assert!(!fx.root.join("Photos").exists());
    assert!(!plan::undo_path(&fx.plan()).exists());
}

#[test]
fn test_replanning_after_apply_leaves_files_in_place() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());
    engine
        .apply(&fx.plan(), &ApplyOptions::default(), &SilentReporter)
        .unwrap();

    let moves = scan_and_plan(&fx, &engine, photo_rules());
    assert_eq!(moves.len(), 5);
    assert!(moves.iter().all(MoveRecord::is_noop));
}

#[test]
fn test_direct_plan_uses_decisions_and_falls_back() {
    let fx = Fixture::new();
    let engine = engine();
    engine
        .scan(&fx.root, &fx.metadata(), &NoEnrichment, &SilentReporter)
        .unwrap();
    let decisions = fx.work.join("decisions.json");
    fs::write(
        &decisions,
        r#"Here you go:
```json
{"decisions": {"x/a.jpg": "Trips/Rome", "y/b.jpg": "Trips/Paris/b.jpg"}}
```"#,
    )
    .unwrap();

    let manifest = engine
        .plan_direct(
            &fx.metadata(),
            &FileAdvisor::new(&decisions),
            &fx.plan(),
            &PlanOptions::default(),
            &SilentReporter,
        )
        .unwrap();
    assert_eq!(manifest.mode, PlanMode::Direct);
    assert_eq!(manifest.total_records, 5);

    let moves = read_plan(&fx.plan());
    let dest = |rel: &str| {
        moves
            .iter()
            .find(|m| m.source == fx.root.join(rel))
            .map(|m| m.final_destination.clone())
            .unwrap()
    };
    assert_eq!(dest("x/a.jpg"), fx.root.join("Trips/Rome/a.jpg"));
    assert_eq!(dest("y/b.jpg"), fx.root.join("Trips/Paris/b.jpg"));
    assert_eq!(dest("y/a.jpg"), fx.root.join("Uncategorized/a.jpg"));
    assert_eq!(
        dest("Lib.photoslibrary/inside.jpg"),
        fx.root.join("Lib.photoslibrary/inside.jpg")
    );
}

#[test]
fn test_plan_into_separate_destination_root() {
    let fx = Fixture::new();
    let engine = engine();
    engine
        .scan(&fx.root, &fx.metadata(), &NoEnrichment, &SilentReporter)
        .unwrap();
    let dest = fx.work.join("sorted");
    let options = PlanOptions {
        destination_root: Some(dest.clone()),
        allow_cross_device: false,
    };
    let manifest = engine
        .plan_rules(&fx.metadata(), photo_rules(), &fx.plan(), &options, &SilentReporter)
        .unwrap();
    let dest = fs::canonicalize(dest).unwrap();
    assert_eq!(manifest.destination_root, dest);
    let moves = read_plan(&fx.plan());
    assert!(moves
        .iter()
        .filter(|m| m.rule == "photos")
        .all(|m| m.final_destination.starts_with(&dest)));
}

#[test]
fn test_invert_plan_writes_undo_manifest() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());
    let out = fx.work.join("inverse.ndjson");
    let written = engine.invert_plan(&fx.plan(), &out).unwrap();
    assert_eq!(written, 4);

    let reader = PlanReader::open(&out).unwrap();
    let manifest = reader.manifest().unwrap().unwrap();
    assert_eq!(manifest.mode, PlanMode::Undo);
    assert_eq!(manifest.executable, 4);
}

#[test]
fn test_cleanup_twice_removes_nothing_more() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("a/b/c")).unwrap();
    fs::create_dir_all(root.join("keep")).unwrap();
    fs::write(root.join("keep/file.txt"), "x").unwrap();

    let first = cleanup_empty_dirs(root).unwrap();
    assert_eq!(first.removed, 3);
    let second = cleanup_empty_dirs(root).unwrap();
    assert_eq!(second.removed, 0);
    assert!(root.join("keep/file.txt").is_file());
}

#[test]
#[cfg(target_os = "linux")]
fn test_apply_stops_when_undo_log_cannot_be_written() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());

    let options = ApplyOptions {
        undo_path: Some(PathBuf::from("/dev/full")),
        ..ApplyOptions::default()
    };
    let report = match engine.apply(&fx.plan(), &options, &SilentReporter) {
        Err(Error::UndoLogFailed { report, .. }) => report,
        other => panic!("expected an undo log failure, got {:?}", other.map(|r| r.report)),
    };

    assert_eq!(report.moved, 0);
    assert!(report.failed >= 4);
    for failure in &report.failures {
        if let MoveOutcome::Failed { reason } = &failure.outcome {
            assert!(reason.starts_with("undo log unavailable"), "{reason}");
        }
    }
    for file in ["x/a.jpg", "y/a.jpg", "y/b.jpg", "docs/report.pdf"] {
        assert!(fx.root.join(file).is_file(), "{file} was moved");
    }
    assert!(!fx.root.join("Photos/b.jpg").exists());
}

#[test]
fn test_cross_device_moves_are_blocked_and_left_alone() {
    let fx = Fixture::new();
    let engine = engine();
    let records = scan_and_plan(&fx, &engine, photo_rules());

    // Pretend Photos/ sits on another device.
    let guarded_plan = fx.work.join("guarded.ndjson");
    let builder = PlanBuilder::new(
        CollisionResolver::new(&fx.root, false),
        DriveGuard::new(false).with_lookup(|dir, _| Ok(if dir.ends_with("Photos") { 2 } else { 1 })),
        PlanManifest::new(&fx.root, &fx.root, PlanMode::Rules),
    );
    let manifest = builder
        .build(records, PlanWriter::create(&guarded_plan).unwrap())
        .unwrap();
    manifest.save(&guarded_plan).unwrap();
    assert_eq!(manifest.blocked, 3);

    let blocked = PlanReader::open(&guarded_plan).unwrap().blocked().unwrap();
    assert_eq!(blocked.len(), 3);
    assert!(blocked
        .iter()
        .all(|b| b.reason.starts_with("CrossDeviceBlocked")));

    let result = engine
        .apply(&guarded_plan, &ApplyOptions::default(), &SilentReporter)
        .unwrap();
    assert_eq!(result.report.blocked, 3);
    assert_eq!(result.report.moved, 1);
    assert_eq!(fs::read_to_string(fx.root.join("x/a.jpg")).unwrap(), "first a");
    assert_eq!(fs::read_to_string(fx.root.join("y/a.jpg")).unwrap(), "second a");
    assert_eq!(fs::read_to_string(fx.root.join("y/b.jpg")).unwrap(), "b");
    assert!(!fx.root.join("Photos").exists());
}

#[test]
fn test_scan_skips_its_own_outputs_inside_the_root() {
    let fx = Fixture::new();
    let engine = engine();
    let metadata = fx.root.join("metadata.ndjson");
    let plan_path = fx.root.join("plan.ndjson");
    fs::write(&plan_path, "").unwrap();

    // A second scan sees the first scan's index and sidecars on disk.
    for _ in 0..2 {
        let result = engine
            .scan_excluding(
                &fx.root,
                &metadata,
                &plan::artifact_paths(&plan_path),
                &NoEnrichment,
                &SilentReporter,
            )
            .unwrap();
        assert_eq!(result.total_files, 5);
    }

    engine
        .plan_rules(&metadata, Vec::new(), &plan_path, &PlanOptions::default(), &SilentReporter)
        .unwrap();
    let sources: HashSet<PathBuf> = read_plan(&plan_path)
        .into_iter()
        .filter(|r| !r.is_noop())
        .map(|r| r.source)
        .collect();
    assert!(!sources.contains(&metadata));
    assert!(!sources.contains(&plan_path));
}

#[test]
fn test_apply_root_override_drives_cleanup() {
    let fx = Fixture::new();
    let engine = engine();
    scan_and_plan(&fx, &engine, photo_rules());
    fs::remove_file(PlanManifest::sidecar(&fx.plan())).unwrap();

    let options = ApplyOptions {
        cleanup: true,
        root: Some(fx.root.clone()),
        ..ApplyOptions::default()
    };
    let result = engine.apply(&fx.plan(), &options, &SilentReporter).unwrap();
    assert_eq!(result.report.moved, 4);
    assert!(!fx.root.join("x").exists());
    assert!(!fx.root.join("y").exists());
}
