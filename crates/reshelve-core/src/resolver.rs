use crate::model::MoveRecord;
use crate::paths::{claim_key, join_relative, relative_slash_path, split_name};
use ahash::AHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tells the resolver whether a destination is already occupied on disk.
pub trait ExistenceCheck: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

/// Check that never finds anything. Collisions are then only tracked
/// within the plan being built.
pub struct NoCheck;

impl ExistenceCheck for NoCheck {
    fn exists(&self, _path: &Path) -> bool {
        false
    }
}

/// Check backed by the real filesystem. Broken symlinks count as occupied.
pub struct DiskCheck;

impl ExistenceCheck for DiskCheck {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }
}

/// Rewrites final destinations so that no two moves in a plan, and no move
/// and a pre-existing file, share a path.
///
/// The claim table maps a normalized destination to the next suffix worth
/// trying, so repeated collisions on one name stay amortized O(1). It holds
/// one entry per claimed destination and is owned by a single plan build.
pub struct CollisionResolver {
    destination_root: PathBuf,
    case_insensitive: bool,
    claims: AHashMap<String, u32>,
    existence: Box<dyn ExistenceCheck>,
    collisions: usize,
}

impl CollisionResolver {
    pub fn new(destination_root: &Path, case_insensitive: bool) -> Self {
        Self {
            destination_root: destination_root.to_path_buf(),
            case_insensitive,
            claims: AHashMap::new(),
            existence: Box::new(NoCheck),
            collisions: 0,
        }
    }

    pub fn with_existence_check(mut self, check: impl ExistenceCheck + 'static) -> Self {
        self.existence = Box::new(check);
        self
    }

    /// Mark a destination (relative to the destination root) as taken.
    pub fn seed(&mut self, relative: &str) {
        self.claims
            .entry(claim_key(relative, self.case_insensitive))
            .or_insert(1);
    }

    /// Number of records whose destination had to be suffixed.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn claimed(&self) -> usize {
        self.claims.len()
    }

    /// Assign `record.final_destination`. Records whose destination lies
    /// outside the destination root (bundle-protected files kept in place)
    /// are claimed as-is.
    pub fn resolve(&mut self, mut record: MoveRecord) -> MoveRecord {
        let relative = match relative_slash_path(&self.destination_root, &record.destination) {
            Some(rel) if !rel.is_empty() => rel,
            _ => {
                let key = claim_key(
                    &record.destination.to_string_lossy(),
                    self.case_insensitive,
                );
                self.claims.entry(key).or_insert(1);
                record.final_destination = record.destination.clone();
                return record;
            }
        };
        let resolved = self.resolve_relative(&relative, &record.source);
        record.final_destination = self.absolute(&resolved);
        record
    }

    /// Resolve a relative destination for a file currently at `source`.
    pub fn resolve_relative(&mut self, relative: &str, source: &Path) -> String {
        let key = claim_key(relative, self.case_insensitive);
        if !self.claims.contains_key(&key) && self.free_on_disk(relative, source) {
            self.claims.insert(key, 1);
            return relative.to_string();
        }

        let (dir, stem, ext) = split_name(relative);
        let mut counter = self.claims.get(&key).copied().unwrap_or(1);
        loop {
            let candidate = format!("{dir}{stem}_{counter}{ext}");
            counter += 1;
            let candidate_key = claim_key(&candidate, self.case_insensitive);
            if !self.claims.contains_key(&candidate_key) && self.free_on_disk(&candidate, source)
            {
                debug!("Collision on {}, using {}", relative, candidate);
                self.claims.insert(key, counter);
                self.claims.insert(candidate_key, 1);
                self.collisions += 1;
                return candidate;
            }
        }
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        join_relative(&self.destination_root, relative)
    }

    /// A path is free when nothing exists there, or when what exists there is
    /// the file being moved (it is already in place).
    fn free_on_disk(&self, relative: &str, source: &Path) -> bool {
        let candidate = self.absolute(relative);
        if self.same_path(&candidate, source) {
            return true;
        }
        !self.existence.exists(&candidate)
    }

    fn same_path(&self, a: &Path, b: &Path) -> bool {
        if self.case_insensitive {
            a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
        } else {
            a == b
        }
    }
}
