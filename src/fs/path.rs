//! Path validation.
//!
//! The directory tree is a single flat root, so a valid path is one
//! absolute component: a leading `/` (repeats tolerated), then a name with
//! no further separators.

use crate::error::{fail, Error, Result};

/// Validates `path` and returns the name component.
pub(crate) fn check_path(path: &str) -> Result<&[u8]> {
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'/') {
        log::warn!("path {:?} does not start with /", path);
        return fail(Error::Invalid);
    }

    let name = &bytes[bytes.iter().take_while(|&&b| b == b'/').count()..];

    if name.contains(&b'/') {
        log::warn!("subdirectories are not supported ({:?})", path);
        return fail(Error::IsDir);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_single_absolute_component() {
        assert_eq!(check_path("/file").unwrap(), b"file");
        assert_eq!(check_path("//file").unwrap(), b"file");
        assert_eq!(check_path("/.").unwrap(), b".");
        assert_eq!(check_path("/").unwrap(), b"");
    }

    #[test]
    fn rejects_relative_paths() {
        assert_eq!(check_path("file"), Err(Error::Invalid));
        assert_eq!(check_path(""), Err(Error::Invalid));
    }

    #[test]
    fn rejects_subdirectories() {
        assert_eq!(check_path("/dir/file"), Err(Error::IsDir));
        assert_eq!(check_path("/file/"), Err(Error::IsDir));
    }
}
