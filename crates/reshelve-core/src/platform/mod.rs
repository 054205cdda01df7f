#[cfg(target_os = "windows")]
pub mod windows;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Device identifier of the filesystem holding `path`.
#[cfg(unix)]
pub fn device_id(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::symlink_metadata(path)?.dev())
}

#[cfg(target_os = "windows")]
pub fn device_id(path: &Path) -> io::Result<u64> {
    let canonical = fs::canonicalize(path)?;
    windows::drive_device_id(&canonical).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("no drive prefix for {}", canonical.display()),
        )
    })
}

#[cfg(not(any(unix, target_os = "windows")))]
pub fn device_id(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|_| 0)
}

/// Closest ancestor of `path` (or `path` itself) that exists on disk.
pub fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

/// Device of the directory a not-yet-existing path would be created in.
pub fn destination_device_id(path: &Path) -> io::Result<u64> {
    let anchor = nearest_existing_ancestor(path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no existing ancestor for {}", path.display()),
        )
    })?;
    device_id(&anchor)
}

/// Whether an error from `rename` means source and destination are on different devices.
pub fn is_cross_device_error(err: &io::Error) -> bool {
    // EXDEV on Linux and macOS, ERROR_NOT_SAME_DEVICE on Windows.
    #[cfg(unix)]
    let code = 18;
    #[cfg(not(unix))]
    let code = 17;
    err.raw_os_error() == Some(code)
}

/// Rename `from` to `to`, failing with `AlreadyExists` rather than
/// replacing a file that appeared at `to` after it was checked.
pub fn rename_no_replace(from: &Path, to: &Path) -> io::Result<()> {
    match rename_exclusive(from, to) {
        Err(e) if exclusive_rename_unsupported(&e) => {
            // Filesystem without an atomic variant: narrow the window instead.
            if fs::symlink_metadata(to).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", to.display()),
                ));
            }
            fs::rename(from, to)
        }
        other => other,
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn rename_exclusive(from: &Path, to: &Path) -> io::Result<()> {
    let (from, to) = (c_path(from)?, c_path(to)?);
    // SAFETY: both pointers are NUL-terminated strings that outlive the call.
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn rename_exclusive(from: &Path, to: &Path) -> io::Result<()> {
    let (from, to) = (c_path(from)?, c_path(to)?);
    // SAFETY: both pointers are NUL-terminated strings that outlive the call.
    let rc = unsafe { libc::renamex_np(from.as_ptr(), to.as_ptr(), libc::RENAME_EXCL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(
    all(target_os = "linux", target_env = "gnu"),
    target_os = "macos",
    target_os = "ios"
)))]
fn rename_exclusive(_from: &Path, _to: &Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos", target_os = "ios"))]
fn c_path(path: &Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn exclusive_rename_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::ENOTSUP)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_existing_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("a/b/c.txt");
        assert_eq!(
            nearest_existing_ancestor(&missing).unwrap(),
            tmp.path().to_path_buf()
        );
    }

    #[test]
    fn test_destination_device_matches_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("x/y.bin");
        assert_eq!(
            destination_device_id(&missing).unwrap(),
            device_id(tmp.path()).unwrap()
        );
    }

    #[test]
    fn test_rename_no_replace_keeps_existing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let from = tmp.path().join("from.txt");
        let to = tmp.path().join("to.txt");
        fs::write(&from, "new").unwrap();
        fs::write(&to, "old").unwrap();

        let err = rename_no_replace(&from, &to).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&to).unwrap(), "old");
        assert!(from.exists());

        fs::remove_file(&to).unwrap();
        rename_no_replace(&from, &to).unwrap();
        assert_eq!(fs::read_to_string(&to).unwrap(), "new");
        assert!(!from.exists());
    }
}
