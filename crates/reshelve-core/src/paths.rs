use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

const MACOS_BUNDLE_EXTENSIONS: &[&str] = &[
    ".app",
    ".bundle",
    ".plugin",
    ".kext",
    ".prefpane",
    ".qlgenerator",
    ".mdimporter",
    ".xpc",
    ".appex",
    ".dvdproj",
    ".imovieproject",
    ".fcpproject",
    ".fcpbundle",
    ".fcp",
    ".dspproj",
    ".prproj",
    ".photoslibrary",
    ".aplibrary",
];

/// Folder names whose contents form an atomic unit (camera cards, disc images).
const BUNDLE_FOLDERS: &[&str] = &[
    "VIDEO_TS",
    "AUDIO_TS",
    "HVDVD_TS",
    "BDMV",
    "CERTIFICATE",
    "DCIM",
    "PRIVATE",
    "AVCHD",
    "MP_ROOT",
    "Capture Scratch",
    "Render Files",
    "Waveform Cache Files",
    "Thumbnail Cache Files",
    "Final Cut Pro Documents",
];

pub fn is_bundle_name(segment: &str) -> bool {
    if BUNDLE_FOLDERS.contains(&segment) {
        return true;
    }
    let lower = segment.to_lowercase();
    MACOS_BUNDLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// True when any directory component of a `/`-separated relative path is a bundle.
/// The final component (the file name) is not considered.
pub fn path_contains_bundle(rel_path: &str) -> bool {
    let mut parts: Vec<&str> = rel_path.split('/').collect();
    parts.pop();
    parts.into_iter().any(is_bundle_name)
}

/// True when `dir` itself or any of its ancestors below `root` is a bundle.
pub fn dir_within_bundle(root: &Path, dir: &Path) -> bool {
    match dir.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .any(|c| is_bundle_name(&c.as_os_str().to_string_lossy())),
        Err(_) => false,
    }
}

/// `/`-separated relative path of `path` under `root`.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Normalize a rendered relative destination: unify separators, drop empty and
/// `.` segments, trim whitespace around segments. Returns `None` if the path
/// escapes its root (`..`) or is empty.
pub fn normalize_relative(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        let segment = segment.trim();
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Key used for collision detection. Case-folded where the target filesystem
/// ignores case.
pub fn claim_key(rel_path: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        rel_path.to_lowercase()
    } else {
        rel_path.to_string()
    }
}

/// Split `dir/name.ext` into (`dir/`, `name`, `.ext`). Dotfiles keep their
/// leading dot in the stem.
pub fn split_name(rel_path: &str) -> (&str, &str, &str) {
    let (dir, name) = match rel_path.rfind('/') {
        Some(idx) => rel_path.split_at(idx + 1),
        None => ("", rel_path),
    };
    match name.rfind('.') {
        Some(idx) if idx > 0 => (dir, &name[..idx], &name[idx..]),
        _ => (dir, name, ""),
    }
}

/// Path of a companion file written next to a primary artifact,
/// e.g. `plan.ndjson` + `manifest.json` -> `plan.ndjson.manifest.json`.
pub fn sidecar_path(primary: &Path, suffix: &str) -> PathBuf {
    let mut name = primary
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    primary.with_file_name(name)
}

/// Join a `/`-separated relative path onto `root` segment by segment.
pub fn join_relative(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Lexically clean an absolute path (resolve `.` and `..` without touching disk).
pub fn clean_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute, symlink-resolved form of `path`, comparable with scanned
/// paths. Works for files that do not exist yet as long as an ancestor does.
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let cleaned = clean_absolute(&absolute);
    match (cleaned.parent(), cleaned.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => cleaned,
        },
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_detection() {
        assert!(is_bundle_name("Holiday.photoslibrary"));
        assert!(is_bundle_name("VIDEO_TS"));
        assert!(!is_bundle_name("Photos"));
        assert!(path_contains_bundle("proj.fcpbundle/media/clip.mov"));
        assert!(!path_contains_bundle("media/clip.app"));
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(
            normalize_relative("Photos\\\\2024//./trip/a.jpg").as_deref(),
            Some("Photos/2024/trip/a.jpg")
        );
        assert_eq!(normalize_relative("/lead/a.jpg").as_deref(), Some("lead/a.jpg"));
        assert_eq!(normalize_relative("a/../b.jpg"), None);
        assert_eq!(normalize_relative(" / "), None);
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("Photos/a.jpg"), ("Photos/", "a", ".jpg"));
        assert_eq!(split_name("a.tar.gz"), ("", "a.tar", ".gz"));
        assert_eq!(split_name("dir/.bashrc"), ("dir/", ".bashrc", ""));
        assert_eq!(split_name("README"), ("", "README", ""));
    }

    #[test]
    fn test_sidecar_path() {
        let p = sidecar_path(Path::new("/tmp/plan.ndjson"), "manifest.json");
        assert_eq!(p, PathBuf::from("/tmp/plan.ndjson.manifest.json"));
    }

    #[test]
    fn test_clean_absolute() {
        assert_eq!(
            clean_absolute(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn test_absolutize_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(tmp.path()).unwrap();
        assert_eq!(
            absolutize(&tmp.path().join("sub/../plan.ndjson")),
            canonical.join("plan.ndjson")
        );
        fs::write(tmp.path().join("plan.ndjson"), "").unwrap();
        assert_eq!(
            absolutize(&tmp.path().join("plan.ndjson")),
            canonical.join("plan.ndjson")
        );
    }
}
