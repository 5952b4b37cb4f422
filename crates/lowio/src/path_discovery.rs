// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Discovery of directories suitable for temporary files.
//!
//! Two classes of directory are discovered, by probing a platform-specific
//! ordered candidate list and caching the first member that is writable and
//! of the right filesystem class:
//!
//! * **storage backed** — for temp files that may grow large or need to
//!   survive memory pressure;
//! * **memory backed** — a tmpfs/ramfs, for anonymous section backings where
//!   page-cache-speed i/o matters. Falls back to the storage-backed
//!   directory on platforms without a memory filesystem.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::{event, Level};

use crate::utils::temp_file_name;
use crate::{Errc, Error, Result};

/// The discovered storage-backed temporary directory.
pub fn storage_backed_temp_dir() -> Result<&'static Path> {
    static FOUND: Lazy<Option<PathBuf>> = Lazy::new(|| {
        let found = storage_candidates().into_iter().find(|c| is_writable_dir(c));
        event!(Level::TRACE, dir = ?found, "storage-backed temp directory");
        found
    });
    FOUND
        .as_deref()
        .ok_or_else(|| Error::generic(Errc::NoSuchFileOrDirectory))
}

/// The discovered memory-backed (tmpfs/ramfs) temporary directory.
///
/// Falls back to [`storage_backed_temp_dir`] when no memory filesystem is
/// available.
pub fn memory_backed_temp_dir() -> Result<&'static Path> {
    static FOUND: Lazy<Option<PathBuf>> = Lazy::new(|| {
        let found = memory_candidates()
            .into_iter()
            .find(|c| is_writable_dir(c) && is_memory_filesystem(c));
        event!(Level::TRACE, dir = ?found, "memory-backed temp directory");
        found
    });
    match FOUND.as_deref() {
        Some(path) => Ok(path),
        None => storage_backed_temp_dir(),
    }
}

fn storage_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for var in ["TMPDIR", "TMP", "TEMP"] {
        if let Some(dir) = std::env::var_os(var) {
            if !dir.is_empty() {
                candidates.push(PathBuf::from(dir));
            }
        }
    }
    #[cfg(unix)]
    {
        candidates.push(PathBuf::from("/tmp"));
        candidates.push(PathBuf::from("/var/tmp"));
    }
    #[cfg(windows)]
    {
        if let Some(profile) = std::env::var_os("USERPROFILE") {
            candidates.push(PathBuf::from(profile).join("AppData").join("Local").join("Temp"));
        }
    }
    candidates.push(std::env::temp_dir());
    candidates
}

fn memory_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    #[cfg(target_os = "linux")]
    {
        if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            if !dir.is_empty() {
                candidates.push(PathBuf::from(dir));
            }
        }
        // SAFETY: plain uid query.
        let uid = unsafe { libc::getuid() };
        candidates.push(PathBuf::from(format!("/run/user/{uid}")));
        candidates.push(PathBuf::from("/dev/shm"));
        candidates.push(PathBuf::from("/run/shm"));
        candidates.push(PathBuf::from("/tmp"));
    }
    candidates
}

/// Whether we can actually create a file in `dir`, proven by doing so.
fn is_writable_dir(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(temp_file_name());
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(file) => {
            drop(file);
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_memory_filesystem(dir: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    const TMPFS_MAGIC: libc::c_long = 0x0102_1994;
    const RAMFS_MAGIC: libc::c_long = 0x8584_58f6;

    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: out-param struct on the stack, NUL-terminated path.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return false;
    }
    stat.f_type == TMPFS_MAGIC || stat.f_type == RAMFS_MAGIC
}

#[cfg(not(target_os = "linux"))]
fn is_memory_filesystem(_dir: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_dir_exists_and_is_writable() {
        let dir = storage_backed_temp_dir().expect("a storage temp dir");
        assert!(dir.is_dir());
        assert!(is_writable_dir(dir));
    }

    #[test]
    fn memory_dir_resolves_to_something_writable() {
        // May be a real tmpfs or the storage fallback; either way it must
        // be usable.
        let dir = memory_backed_temp_dir().expect("a memory temp dir");
        assert!(is_writable_dir(dir));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dev_shm_is_memory_backed_when_present() {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            assert!(is_memory_filesystem(shm));
        }
    }

    #[test]
    fn ordinary_dirs_are_not_memory_backed() {
        // The current directory is on real storage in any sane checkout.
        let cwd = std::env::current_dir().expect("cwd");
        #[cfg(target_os = "linux")]
        if is_memory_filesystem(&cwd) {
            // Some CI sandboxes run entirely on tmpfs; nothing to assert.
            return;
        }
        assert!(!is_memory_filesystem(&cwd));
    }
}
