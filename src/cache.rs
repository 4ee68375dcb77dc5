//! Cache persistence (spec §4.8).
//!
//! On success, the per-host working tree is moved under a cache root
//! computed from a pattern with placeholders: `%h` (hash of the host
//! string), `%N` (host string), `%P` (process id), and `strftime` codes
//! applied to the run's start timestamp. Reuses the `sha2::{Digest, Sha256}`
//! hashing primitive this crate's ambient stack already carries for content
//! hashing elsewhere, applied here to the host string instead of file
//! contents.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Resolve `%h`/`%N`/`%P` and `strftime` placeholders in `pattern` into a
/// path, relative to `cache_root`.
pub fn resolve_cache_path(
    cache_root: &Path,
    pattern: &str,
    host: &str,
    pid: u32,
    started_at: DateTime<Utc>,
) -> PathBuf {
    let hash = {
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 16)
    };

    let mut resolved = pattern
        .replace("%h", &hash)
        .replace("%N", host)
        .replace("%P", &pid.to_string());
    resolved = strftime_like(&resolved, started_at);

    cache_root.join(resolved)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        if s.len() >= chars {
            break;
        }
        s.push_str(&format!("{b:02x}"));
    }
    s.truncate(chars);
    s
}

/// A tiny subset of `strftime`, since the engine only needs date/time
/// components in cache-path patterns, not general formatting.
fn strftime_like(pattern: &str, when: DateTime<Utc>) -> String {
    pattern
        .replace("%Y", &when.format("%Y").to_string())
        .replace("%m", &when.format("%m").to_string())
        .replace("%d", &when.format("%d").to_string())
        .replace("%H", &when.format("%H").to_string())
        .replace("%M", &when.format("%M").to_string())
        .replace("%S", &when.format("%S").to_string())
}

/// Move `work_dir` into the cache at the path resolved from `pattern`,
/// replacing any existing entry file-by-file, and write a `target_host`
/// marker so the (out-of-scope) dump tool can enumerate entries later
/// (spec §4.8, §6 "Cache entry layout").
pub fn persist(
    work_dir: &Path,
    cache_root: &Path,
    pattern: &str,
    host: &str,
    pid: u32,
    started_at: DateTime<Utc>,
) -> Result<PathBuf, CacheError> {
    let dest = resolve_cache_path(cache_root, pattern, host, pid, started_at);
    if !dest.starts_with(cache_root) {
        return Err(CacheError::PathEscape(dest));
    }

    if dest.exists() {
        replace_file_by_file(work_dir, &dest)?;
        fs::remove_dir_all(work_dir)?;
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(work_dir, &dest).map_err(|source| CacheError::Move {
            from: work_dir.to_path_buf(),
            to: dest.clone(),
            source,
        })?;
    }

    fs::write(dest.join("target_host"), host)?;
    Ok(dest)
}

fn replace_file_by_file(src: &Path, dst: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            replace_file_by_file(&entry.path(), &dst_path)?;
        } else {
            if dst_path.exists() {
                fs::remove_file(&dst_path)?;
            }
            fs::rename(entry.path(), &dst_path).map_err(|source| CacheError::Move {
                from: entry.path(),
                to: dst_path,
                source,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolves_host_hash_and_name_placeholders() {
        let root = tempdir().unwrap();
        let when = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let path = resolve_cache_path(root.path(), "%N/%h", "example.com", 123, when);
        assert!(path.starts_with(root.path().join("example.com")));
        assert_eq!(path.file_name().unwrap().to_string_lossy().len(), 16);
    }

    #[test]
    fn persist_moves_working_tree_and_writes_target_host() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        fs::write(work.path().join("object_marker"), "x").unwrap();
        let when = Utc::now();

        let dest = persist(work.path(), root.path(), "%N", "host-a", 1, when).unwrap();
        assert!(dest.join("object_marker").exists());
        assert_eq!(fs::read_to_string(dest.join("target_host")).unwrap(), "host-a");
        assert!(!work.path().exists());
    }

    #[test]
    fn persist_replaces_existing_entry_file_by_file() {
        let root = tempdir().unwrap();
        let dest = root.path().join("host-a");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale"), "old").unwrap();

        let work = tempdir().unwrap();
        fs::write(work.path().join("fresh"), "new").unwrap();
        let when = Utc::now();

        persist(work.path(), root.path(), "%N", "host-a", 1, when).unwrap();
        assert!(dest.join("fresh").exists());
        assert!(dest.join("stale").exists());
    }
}
