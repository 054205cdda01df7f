use crate::error::Error;
use crate::guard::DriveGuard;
use crate::index::{NdjsonReader, NdjsonWriter, Records};
use crate::model::{BlockedMove, MoveRecord};
use crate::paths::sidecar_path;
use crate::resolver::CollisionResolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PLAN_VERSION: u32 = 1;
const MANIFEST_SUFFIX: &str = "manifest.json";
const BLOCKED_SUFFIX: &str = "blocked.ndjson";
const UNDO_SUFFIX: &str = "undo.ndjson";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    #[default]
    Rules,
    Direct,
    Undo,
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanMode::Rules => "rules",
            PlanMode::Direct => "direct",
            PlanMode::Undo => "undo",
        })
    }
}

/// Summary written next to every plan as `<plan>.manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanManifest {
    pub version: u32,
    pub generated_at: Option<DateTime<Utc>>,
    pub root: PathBuf,
    pub destination_root: PathBuf,
    pub mode: PlanMode,
    pub total_records: usize,
    pub executable: usize,
    pub blocked: usize,
    pub collisions_resolved: usize,
    pub template_errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_fingerprint: Option<String>,
}

impl PlanManifest {
    pub fn new(root: &Path, destination_root: &Path, mode: PlanMode) -> Self {
        Self {
            version: PLAN_VERSION,
            generated_at: Some(Utc::now()),
            root: root.to_path_buf(),
            destination_root: destination_root.to_path_buf(),
            mode,
            ..Self::default()
        }
    }

    pub fn sidecar(plan_path: &Path) -> PathBuf {
        sidecar_path(plan_path, MANIFEST_SUFFIX)
    }

    pub fn save(&self, plan_path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(Self::sidecar(plan_path), json)?;
        Ok(())
    }

    /// `None` when the plan has no manifest (e.g. a hand-written plan).
    pub fn load(plan_path: &Path) -> Result<Option<Self>, Error> {
        let path = Self::sidecar(plan_path);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}

/// Default location of the undo plan produced when applying `plan_path`.
pub fn undo_path(plan_path: &Path) -> PathBuf {
    sidecar_path(plan_path, UNDO_SUFFIX)
}

pub fn blocked_path(plan_path: &Path) -> PathBuf {
    sidecar_path(plan_path, BLOCKED_SUFFIX)
}

/// Every file a plan at `plan_path` produces: the plan, its sidecars, and
/// the default undo plan with its manifest.
pub fn artifact_paths(plan_path: &Path) -> Vec<PathBuf> {
    let undo = undo_path(plan_path);
    vec![
        plan_path.to_path_buf(),
        PlanManifest::sidecar(plan_path),
        blocked_path(plan_path),
        PlanManifest::sidecar(&undo),
        undo,
    ]
}

/// Streams an executable plan plus its blocked-move sidecar to disk.
pub struct PlanWriter {
    path: PathBuf,
    moves: NdjsonWriter<MoveRecord>,
    blocked: NdjsonWriter<BlockedMove>,
}

impl PlanWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            moves: NdjsonWriter::create(path)?,
            blocked: NdjsonWriter::create(&blocked_path(path))?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, record: &MoveRecord) -> Result<(), Error> {
        self.moves.write(record)
    }

    pub fn block(&mut self, blocked: &BlockedMove) -> Result<(), Error> {
        self.blocked.write(blocked)
    }

    /// Flush both streams. Returns (executable, blocked) counts.
    pub fn finish(self) -> Result<(usize, usize), Error> {
        let executable = self.moves.finish()?;
        let blocked = self.blocked.finish()?;
        Ok((executable, blocked))
    }
}

/// Read side of a plan: the move stream, its blocked sidecar and manifest.
pub struct PlanReader {
    moves: NdjsonReader<MoveRecord>,
}

impl PlanReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            moves: NdjsonReader::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.moves.path()
    }

    pub fn records(&self) -> Result<Records<MoveRecord>, Error> {
        self.moves.records()
    }

    /// Blocked moves recorded at plan time. Empty when the sidecar is absent.
    pub fn blocked(&self) -> Result<Vec<BlockedMove>, Error> {
        let path = blocked_path(self.path());
        if !path.is_file() {
            return Ok(Vec::new());
        }
        NdjsonReader::<BlockedMove>::open(&path)?
            .records()?
            .collect()
    }

    pub fn manifest(&self) -> Result<Option<PlanManifest>, Error> {
        PlanManifest::load(self.path())
    }
}

/// Drives moves through collision resolution and the drive guard, writing
/// the plan incrementally. Nothing but the claim table and the guard's
/// device cache is held in memory.
pub struct PlanBuilder {
    resolver: CollisionResolver,
    guard: DriveGuard,
    manifest: PlanManifest,
}

impl PlanBuilder {
    pub fn new(resolver: CollisionResolver, guard: DriveGuard, manifest: PlanManifest) -> Self {
        Self {
            resolver,
            guard,
            manifest,
        }
    }

    /// Resolve, guard and persist `moves` into `writer`. The returned
    /// manifest is not saved; callers fill in compiler statistics first.
    pub fn build<I>(mut self, moves: I, mut writer: PlanWriter) -> Result<PlanManifest, Error>
    where
        I: IntoIterator<Item = MoveRecord>,
    {
        let mut total = 0usize;
        for planned in moves {
            total += 1;
            let resolved = self.resolver.resolve(planned);
            match self.guard.check_move(&resolved) {
                Ok(()) => writer.write(&resolved)?,
                Err(blocked) => writer.block(&blocked)?,
            }
            if total % 100_000 == 0 {
                debug!("Planned {} moves", total);
            }
        }
        let path = writer.path().to_path_buf();
        let (executable, blocked) = writer.finish()?;

        let mut manifest = self.manifest;
        manifest.total_records = total;
        manifest.executable = executable;
        manifest.blocked = blocked;
        manifest.collisions_resolved = self.resolver.collisions();
        info!(
            "Plan {}: {} moves, {} blocked, {} collisions resolved",
            path.display(),
            executable,
            blocked,
            manifest.collisions_resolved
        );
        Ok(manifest)
    }
}

/// Write the inverse of `plan` to `out`: every non-trivial move reversed.
/// Returns the number of records written.
pub fn invert(plan: &PlanReader, out: &Path) -> Result<usize, Error> {
    let mut writer = NdjsonWriter::<MoveRecord>::create(out)?;
    for record in plan.records()? {
        let record = record?;
        if !record.is_noop() {
            writer.write(&record.inverted())?;
        }
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn planned(root: &Path, source: &str, dest: &str) -> MoveRecord {
        MoveRecord {
            source: root.join(source),
            destination: root.join(dest),
            final_destination: root.join(dest),
            rule: "r".to_string(),
        }
    }

    #[test]
    fn test_build_writes_plan_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let plan_path = tmp.path().join("out/plan.ndjson");

        let builder = PlanBuilder::new(
            CollisionResolver::new(&root, false),
            DriveGuard::new(true),
            PlanManifest::new(&root, &root, PlanMode::Rules),
        );
        let moves = vec![
            planned(&root, "x/a.jpg", "Photos/a.jpg"),
            planned(&root, "y/a.jpg", "Photos/a.jpg"),
            planned(&root, "b.jpg", "Photos/b.jpg"),
        ];
        let mut manifest = builder
            .build(moves, PlanWriter::create(&plan_path).unwrap())
            .unwrap();
        manifest.template_errors = 2;
        manifest.save(&plan_path).unwrap();

        let reader = PlanReader::open(&plan_path).unwrap();
        let finals: HashSet<PathBuf> = reader
            .records()
            .unwrap()
            .map(|r| r.unwrap().final_destination)
            .collect();
        assert_eq!(finals.len(), 3);
        assert!(finals.contains(&root.join("Photos/a_1.jpg")));

        let loaded = reader.manifest().unwrap().unwrap();
        assert_eq!(loaded.total_records, 3);
        assert_eq!(loaded.executable, 3);
        assert_eq!(loaded.collisions_resolved, 1);
        assert_eq!(loaded.template_errors, 2);
        assert!(reader.blocked().unwrap().is_empty());
    }

    #[test]
    fn test_blocked_moves_go_to_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let plan_path = root.join("plan.ndjson");
        let guard = DriveGuard::new(false).with_lookup(|dir: &Path, _| {
            Ok(if dir.to_string_lossy().contains("Elsewhere") { 2 } else { 1 })
        });
        let builder = PlanBuilder::new(
            CollisionResolver::new(&root, false),
            guard,
            PlanManifest::new(&root, &root, PlanMode::Rules),
        );
        let moves = vec![
            planned(&root, "a.txt", "Docs/a.txt"),
            planned(&root, "b.txt", "Elsewhere/b.txt"),
        ];
        let manifest = builder
            .build(moves, PlanWriter::create(&plan_path).unwrap())
            .unwrap();
        assert_eq!(manifest.executable, 1);
        assert_eq!(manifest.blocked, 1);

        let reader = PlanReader::open(&plan_path).unwrap();
        let blocked = reader.blocked().unwrap();
        assert_eq!(blocked[0].record.source, root.join("b.txt"));
        assert!(reader
            .records()
            .unwrap()
            .all(|r| r.unwrap().source != root.join("b.txt")));
    }

    #[test]
    fn test_invert_skips_noops() {
        let tmp = tempfile::tempdir().unwrap();
        let plan_path = tmp.path().join("plan.ndjson");
        let mut writer = PlanWriter::create(&plan_path).unwrap();
        writer
            .write(&planned(tmp.path(), "a.txt", "Docs/a.txt"))
            .unwrap();
        writer.write(&planned(tmp.path(), "b.txt", "b.txt")).unwrap();
        writer.finish().unwrap();

        let out = undo_path(&plan_path);
        let reader = PlanReader::open(&plan_path).unwrap();
        assert_eq!(invert(&reader, &out).unwrap(), 1);
        let undo: Vec<MoveRecord> = PlanReader::open(&out)
            .unwrap()
            .records()
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(undo[0].source, tmp.path().join("Docs/a.txt"));
        assert_eq!(undo[0].rule, "undo:r");
    }
}
