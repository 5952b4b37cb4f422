// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Non-owning filesystem path slices.
//!
//! [`PathView`] is a borrowed view over a filesystem path. It decomposes the
//! path the same way [`std::path::Path`] does — every accessor is defined to
//! agree with its `std::path` counterpart character-for-character on the same
//! input — while adding the handful of queries a low-level I/O library needs
//! and `std::path` does not provide:
//!
//! * [`contains_glob`](PathView::contains_glob) — does any component carry a
//!   kernel-side wildcard?
//! * [`is_ntpath`](PathView::is_ntpath) — is this a raw NT kernel namespace
//!   path (`\!!\` or `\??\` prefixed)?
//! * [`is_deleted`](PathView::is_deleted) — does the leaf match the
//!   32-hex-character + `.deleted` pattern used by unlink emulation?
//!
//! A `PathView` never owns its storage. It is `Copy`, two machine words, and
//! every accessor returning a path returns another view into the same buffer.

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Components, Path};

/// A borrowed slice of a filesystem path.
///
/// See the [crate docs](crate) for the decomposition contract.
#[derive(Clone, Copy)]
pub struct PathView<'a> {
    path: &'a Path,
}

impl<'a> PathView<'a> {
    /// Wraps anything path-like without copying it.
    pub fn new(path: &'a (impl AsRef<Path> + ?Sized)) -> Self {
        Self { path: path.as_ref() }
    }

    /// The underlying `std::path::Path`.
    #[must_use]
    pub const fn as_path(&self) -> &'a Path {
        self.path
    }

    /// The path as the platform's native byte encoding.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.path.as_os_str().as_encoded_bytes()
    }

    /// Whether the view is the empty path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// The root directory component (`/`), or an empty view if the path is
    /// relative.
    #[must_use]
    pub fn root_directory(&self) -> Self {
        for component in self.path.components() {
            match component {
                Component::RootDir => return Self::new(component.as_os_str()),
                Component::Prefix(_) => continue,
                _ => break,
            }
        }
        Self::new("")
    }

    /// The root name plus root directory — everything before the first
    /// relative component.
    #[must_use]
    pub fn root_path(&self) -> Self {
        let mut components = self.path.components();
        loop {
            let rest = components.clone();
            match components.next() {
                Some(Component::Prefix(_) | Component::RootDir) => {}
                _ => {
                    let consumed = self.path.as_os_str().as_encoded_bytes().len()
                        - rest.as_path().as_os_str().as_encoded_bytes().len();
                    let bytes = &self.path.as_os_str().as_encoded_bytes()[..consumed];
                    // SAFETY: the prefix of valid OsStr bytes ending on a
                    // component boundary is itself a valid OsStr.
                    let os = unsafe { OsStr::from_encoded_bytes_unchecked(bytes) };
                    return Self::new(Path::new(os));
                }
            }
        }
    }

    /// The path with [`root_path`](Self::root_path) removed.
    #[must_use]
    pub fn relative_path(&self) -> Self {
        let mut components = self.path.components();
        loop {
            let rest = components.clone();
            match components.next() {
                Some(Component::Prefix(_) | Component::RootDir) => {}
                _ => return Self::new(rest.as_path()),
            }
        }
    }

    /// The parent of this path, or an empty view for roots and single
    /// components. Agrees with [`Path::parent`].
    #[must_use]
    pub fn parent_path(&self) -> Self {
        match self.path.parent() {
            Some(parent) => Self::new(parent),
            None => Self::new(""),
        }
    }

    /// The final component, if it names a file or directory.
    /// Agrees with [`Path::file_name`].
    #[must_use]
    pub fn filename(&self) -> Option<&'a OsStr> {
        self.path.file_name()
    }

    /// The filename with its extension removed. Agrees with
    /// [`Path::file_stem`].
    #[must_use]
    pub fn stem(&self) -> Option<&'a OsStr> {
        self.path.file_stem()
    }

    /// The extension of the filename, without the dot. Agrees with
    /// [`Path::extension`].
    #[must_use]
    pub fn extension(&self) -> Option<&'a OsStr> {
        self.path.extension()
    }

    /// This view with the filename removed; the view itself if there is no
    /// filename to remove.
    #[must_use]
    pub fn remove_filename(&self) -> Self {
        if self.path.file_name().is_some() {
            self.parent_path()
        } else {
            *self
        }
    }

    /// Iterates the components of the path. The iterator is double-ended.
    #[must_use]
    pub fn components(&self) -> Components<'a> {
        self.path.components()
    }

    /// Whether any character of the path is a wildcard recognized by kernel
    /// or user-side glob matching (`*`, `?`, `[`).
    #[must_use]
    pub fn contains_glob(&self) -> bool {
        self.as_bytes().iter().any(|&b| b == b'*' || b == b'?' || b == b'[')
    }

    /// Whether this is a raw NT kernel namespace path (`\!!\` or `\??\`
    /// prefixed). Such paths are passed to the kernel without reparsing.
    #[must_use]
    pub fn is_ntpath(&self) -> bool {
        let bytes = self.as_bytes();
        bytes.starts_with(br"\!!\") || bytes.starts_with(br"\??\")
    }

    /// Whether the path is absolute.
    ///
    /// On Windows the `//?`, `//.`, `/??` and `/!!` prefixes are absolute and
    /// a bare leading separator is *relative* (to the per-drive current
    /// directory); elsewhere a leading separator is absolute.
    #[must_use]
    pub fn is_absolute(&self) -> bool {
        #[cfg(windows)]
        {
            let bytes = self.as_bytes();
            if bytes.len() >= 3 {
                // Compare the first three characters with separators
                // normalized to backslash.
                let mut head = [0u8; 3];
                for (slot, &b) in head.iter_mut().zip(bytes) {
                    *slot = if b == b'/' { b'\\' } else { b };
                }
                if matches!(&head, br"\\?" | br"\\." | br"\??" | br"\!!") {
                    return true;
                }
            }
            self.path.is_absolute()
        }
        #[cfg(not(windows))]
        {
            self.path.has_root()
        }
    }

    /// Whether the leaf matches the unlink-emulation rename pattern: exactly
    /// 32 hexadecimal characters followed by `.deleted`.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        let Some(name) = self.path.file_name() else {
            return false;
        };
        let name = name.as_encoded_bytes();
        name.len() == 40
            && name.ends_with(b".deleted")
            && name[..32].iter().all(u8::is_ascii_hexdigit)
    }
}

impl fmt::Debug for PathView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.path, f)
    }
}

impl fmt::Display for PathView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

impl PartialEq for PathView<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for PathView<'_> {}

impl PartialOrd for PathView<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathView<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(other.path)
    }
}

impl Hash for PathView<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl<'a> From<&'a Path> for PathView<'a> {
    fn from(path: &'a Path) -> Self {
        Self { path }
    }
}

impl AsRef<Path> for PathView<'_> {
    fn as_ref(&self) -> &Path {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PathView<'static>: Send, Sync, Copy);

    /// The representative input set. Every accessor must agree with the
    /// `std::path::Path` accessor of the same meaning on each of these.
    fn inputs() -> Vec<&'static str> {
        let mut v = vec![
            "/mnt/c/Users/ned/Documents/boostish/afio/programs/build_posix/testdir",
            "/mnt/c/Users/ned/Documents/boostish/afio/programs/build_posix/testdir/",
            "/mnt/c/Users/ned/Documents/boostish/afio/programs/build_posix/testdir/0",
            "/mnt/c/Users/ned/Documents/boostish/afio/programs/build_posix/testdir/0.txt",
            "0",
            "0.txt",
            "0.foo.txt",
            ".0.foo.txt",
            ".",
            "..",
            "/",
            "//",
        ];
        if cfg!(windows) {
            v.push("\\niall\\douglas.txt");
            v.push("\\\\?\\niall\\douglas.txt");
        }
        v
    }

    #[test]
    fn filename_stem_extension_parity() {
        for input in inputs() {
            let p = Path::new(input);
            let v = PathView::new(input);
            assert_eq!(v.filename(), p.file_name(), "filename of {input:?}");
            assert_eq!(v.stem(), p.file_stem(), "stem of {input:?}");
            assert_eq!(v.extension(), p.extension(), "extension of {input:?}");
        }
    }

    #[test]
    fn parent_path_parity() {
        for input in inputs() {
            let p = Path::new(input);
            let v = PathView::new(input);
            let expected = p.parent().unwrap_or_else(|| Path::new(""));
            assert_eq!(v.parent_path().as_path(), expected, "parent of {input:?}");
        }
    }

    #[test]
    fn root_decomposition_parity() {
        for input in inputs() {
            let p = Path::new(input);
            let v = PathView::new(input);

            // root_path + relative_path must reassemble to the same component
            // sequence as the input.
            let mut reassembled = PathBuf::from(v.root_path().as_path());
            reassembled.push(v.relative_path().as_path());
            assert_eq!(
                reassembled.components().collect::<Vec<_>>(),
                p.components().collect::<Vec<_>>(),
                "root/relative decomposition of {input:?}"
            );

            // The relative part never has a root.
            assert!(!v.relative_path().as_path().has_root() || input.is_empty());

            // root_directory is "/" exactly when the path has a root.
            assert_eq!(
                !v.root_directory().is_empty(),
                p.has_root(),
                "root_directory of {input:?}"
            );
        }
    }

    #[test]
    fn iteration_parity_forwards_and_backwards() {
        for input in inputs() {
            let p = Path::new(input);
            let v = PathView::new(input);
            let forwards: Vec<_> = v.components().collect();
            let expected: Vec<_> = p.components().collect();
            assert_eq!(forwards, expected, "forward iteration of {input:?}");

            let mut backwards: Vec<_> = v.components().rev().collect();
            backwards.reverse();
            assert_eq!(backwards, expected, "backward iteration of {input:?}");
        }
    }

    #[test]
    fn remove_filename_removes_only_the_leaf() {
        let v = PathView::new("/a/b/c.txt");
        assert_eq!(v.remove_filename().as_path(), Path::new("/a/b"));

        // No filename to remove.
        let root = PathView::new("/");
        assert_eq!(root.remove_filename().as_path(), Path::new("/"));
    }

    #[test]
    fn glob_detection() {
        assert!(PathView::new("dir/*.txt").contains_glob());
        assert!(PathView::new("file?.log").contains_glob());
        assert!(PathView::new("[abc]").contains_glob());
        assert!(!PathView::new("plain/path.txt").contains_glob());
    }

    #[test]
    fn ntpath_detection() {
        assert!(PathView::new(r"\!!\Device\HarddiskVolume1").is_ntpath());
        assert!(PathView::new(r"\??\C:\foo").is_ntpath());
        assert!(!PathView::new("/dev/sda").is_ntpath());
        assert!(!PathView::new(r"C:\foo").is_ntpath());
    }

    #[test]
    fn deleted_leaf_detection() {
        assert!(PathView::new("0123456789abcdef0123456789abcdef.deleted").is_deleted());
        assert!(PathView::new("/tmp/dir/0123456789ABCDEF0123456789ABCDEF.deleted").is_deleted());
        // Wrong hex count.
        assert!(!PathView::new("0123456789abcdef.deleted").is_deleted());
        // Non-hex character.
        assert!(!PathView::new("z123456789abcdef0123456789abcdef.deleted").is_deleted());
        // Wrong suffix.
        assert!(!PathView::new("0123456789abcdef0123456789abcdef.removed").is_deleted());
        assert!(!PathView::new("/").is_deleted());
    }

    #[cfg(unix)]
    #[test]
    fn absolute_follows_platform_rules() {
        assert!(PathView::new("/etc").is_absolute());
        assert!(PathView::new("//server/share").is_absolute());
        assert!(!PathView::new("etc").is_absolute());
        assert!(!PathView::new("./etc").is_absolute());
    }
}
