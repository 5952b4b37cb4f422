// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use rand::RngCore;

/// Generates a random leaf name of exactly 32 lowercase hexadecimal
/// characters.
///
/// This is the shape shared by [`FileHandle::random_file`]
/// (crate::FileHandle::random_file), the unlink-emulation rename (which
/// appends `.deleted`), and the `fastdeleted` enumeration filter.
#[must_use]
pub fn temp_file_name() -> String {
    use std::fmt::Write as _;

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut name = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

/// Converts a path into the NUL-terminated form the kernel wants.
#[cfg(unix)]
pub(crate) fn to_cstring(path: &std::path::Path) -> crate::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| crate::Error::generic(crate::Errc::InvalidArgument).with_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_32_hex_chars() {
        let name = temp_file_name();
        assert_eq!(name.len(), 32);
        assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn names_do_not_collide_casually() {
        assert_ne!(temp_file_name(), temp_file_name());
    }

    #[test]
    fn deleted_form_matches_the_filter() {
        let deleted = format!("{}.deleted", temp_file_name());
        assert!(pathview::PathView::new(&deleted).is_deleted());
    }
}
