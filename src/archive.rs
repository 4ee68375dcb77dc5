//! Directory archiving for transfer.
//!
//! [`should_archive`] implements the files-limit policy from the transport
//! spec: a source directory is archived only when it holds more than one
//! top-level entry *and* archiving is enabled in [`crate::config::Settings`].
//! Otherwise the remote transport falls back to copying entries one by one.

use std::fs;
use std::io;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Number of top-level directory entries at or below which archiving is
/// skipped in favour of copying files individually.
pub const FILES_LIMIT: usize = 1;

/// Count the top-level entries of a directory (non-recursive).
pub fn top_level_entry_count(dir: &Path) -> io::Result<usize> {
    Ok(fs::read_dir(dir)?.count())
}

/// Decide whether `dir` should be archived before transfer.
///
/// `archiving_enabled` is the configured policy; the files-limit check
/// (`> 1` top-level entries) is always applied on top of it.
pub fn should_archive(dir: &Path, archiving_enabled: bool) -> io::Result<bool> {
    if !archiving_enabled {
        return Ok(false);
    }
    Ok(top_level_entry_count(dir)? > FILES_LIMIT)
}

/// Build a gzip-compressed tar of `dir` at `dest_tar_gz`.
///
/// The archive is rooted at `dir`'s own entries (not at `dir` itself), so
/// extracting it at the remote destination reproduces `dir`'s contents
/// directly rather than nesting them under `dir`'s basename.
pub fn create_tar_gz(dir: &Path, dest_tar_gz: &Path) -> io::Result<()> {
    let tar_gz = fs::File::create(dest_tar_gz)?;
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Extract a gzip-compressed tar previously built with [`create_tar_gz`]
/// into `dest_dir`, creating it if necessary.
pub fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dest_dir)?;
    let tar_gz = fs::File::open(archive)?;
    let dec = flate2::read::GzDecoder::new(tar_gz);
    let mut archive = tar::Archive::new(dec);
    archive.unpack(dest_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn single_entry_skips_archiving() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), b"x").unwrap();
        assert!(!should_archive(dir.path(), true).unwrap());
    }

    #[test]
    fn multiple_entries_archive_when_enabled() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), b"x").unwrap();
        fs::write(dir.path().join("two"), b"y").unwrap();
        assert!(should_archive(dir.path(), true).unwrap());
        assert!(!should_archive(dir.path(), false).unwrap());
    }

    #[test]
    fn round_trip_tar_gz() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("a"), b"hello").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b"), b"world").unwrap();

        let staging = tempdir().unwrap();
        let archive_path = staging.path().join("out.tar.gz");
        create_tar_gz(src.path(), &archive_path).unwrap();

        let dest = tempdir().unwrap();
        extract_tar_gz(&archive_path, dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("a")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.path().join("sub/b")).unwrap(), b"world");
    }
}
