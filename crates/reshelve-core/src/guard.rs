use crate::error::Error;
use crate::model::{BlockedMove, MoveRecord};
use crate::platform;
use ahash::AHashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolves the device of a directory. The flag is set for destination
/// directories, which may not exist yet.
pub type DeviceLookup = dyn Fn(&Path, bool) -> io::Result<u64> + Send + Sync;

fn platform_lookup(dir: &Path, may_not_exist: bool) -> io::Result<u64> {
    if may_not_exist {
        platform::destination_device_id(dir)
    } else {
        platform::device_id(dir)
    }
}

/// Validates plan preconditions: a reachable root and same-device moves.
///
/// Device lookups are cached per directory, so checking a plan costs one
/// `stat` per distinct source or destination directory.
pub struct DriveGuard {
    allow_cross_device: bool,
    lookup: Box<DeviceLookup>,
    devices: AHashMap<PathBuf, Option<u64>>,
    blocked: usize,
}

impl DriveGuard {
    pub fn new(allow_cross_device: bool) -> Self {
        Self {
            allow_cross_device,
            lookup: Box::new(platform_lookup),
            devices: AHashMap::new(),
            blocked: 0,
        }
    }

    /// Replace the platform device lookup (mount tables, test doubles).
    pub fn with_lookup(
        mut self,
        lookup: impl Fn(&Path, bool) -> io::Result<u64> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    /// Canonical form of `root`, or `RootNotFound` if it is missing or not a
    /// directory.
    pub fn check_root(root: &Path) -> Result<PathBuf, Error> {
        match fs::canonicalize(root) {
            Ok(canonical) if canonical.is_dir() => Ok(canonical),
            _ => Err(Error::RootNotFound(root.to_path_buf())),
        }
    }

    pub fn blocked(&self) -> usize {
        self.blocked
    }

    /// `Err` carries the move, tagged `CrossDeviceBlocked`, when source and
    /// final destination live on different devices and that is not allowed.
    pub fn check_move(&mut self, record: &MoveRecord) -> Result<(), BlockedMove> {
        if self.allow_cross_device || record.is_noop() {
            return Ok(());
        }

        let source_dir = record.source.parent().unwrap_or(&record.source);
        let source_device = self.device_of(source_dir, false);
        let destination_dir = record
            .final_destination
            .parent()
            .unwrap_or(&record.final_destination);
        let destination_device = self.device_of(destination_dir, true);

        match (source_device, destination_device) {
            (Some(src), Some(dst)) if src != dst => {
                self.blocked += 1;
                let reason = format!(
                    "CrossDeviceBlocked: source on device {src}, destination on device {dst}"
                );
                debug!("{}: {}", record.source.display(), reason);
                Err(BlockedMove {
                    record: record.clone(),
                    reason,
                })
            }
            // An unreadable source is reported by the executor as missing.
            _ => Ok(()),
        }
    }

    fn device_of(&mut self, dir: &Path, may_not_exist: bool) -> Option<u64> {
        if let Some(cached) = self.devices.get(dir) {
            return *cached;
        }
        let device = match (self.lookup)(dir, may_not_exist) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Cannot determine device of {}: {}", dir.display(), e);
                None
            }
        };
        self.devices.insert(dir.to_path_buf(), device);
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(DriveGuard::check_root(tmp.path()).is_ok());
        assert!(matches!(
            DriveGuard::check_root(&tmp.path().join("missing")),
            Err(Error::RootNotFound(_))
        ));
    }

    #[test]
    fn test_same_device_moves_pass() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        let record = MoveRecord {
            source: tmp.path().join("a.txt"),
            destination: tmp.path().join("Docs/a.txt"),
            final_destination: tmp.path().join("Docs/a.txt"),
            rule: "docs".to_string(),
        };
        let mut guard = DriveGuard::new(false);
        assert!(guard.check_move(&record).is_ok());
        assert_eq!(guard.blocked(), 0);
    }

    #[test]
    fn test_cross_device_moves_are_blocked() {
        let record = MoveRecord {
            source: PathBuf::from("/mnt/a/photo.jpg"),
            destination: PathBuf::from("/mnt/b/Photos/photo.jpg"),
            final_destination: PathBuf::from("/mnt/b/Photos/photo.jpg"),
            rule: "photos".to_string(),
        };
        let mut guard = DriveGuard::new(false).with_lookup(|dir: &Path, _| {
            Ok(if dir.starts_with("/mnt/a") { 1 } else { 2 })
        });
        let blocked = guard.check_move(&record).unwrap_err();
        assert!(blocked.reason.starts_with("CrossDeviceBlocked"));
        assert_eq!(blocked.record, record);
        assert_eq!(guard.blocked(), 1);
    }

    #[test]
    fn test_allow_cross_device_skips_lookups() {
        let record = MoveRecord {
            source: PathBuf::from("/nonexistent/a"),
            destination: PathBuf::from("/elsewhere/a"),
            final_destination: PathBuf::from("/elsewhere/a"),
            rule: "r".to_string(),
        };
        let mut guard = DriveGuard::new(true);
        assert!(guard.check_move(&record).is_ok());
    }
}
