//! Messaging (spec §4.9 / §6 "Messages file").
//!
//! Each type-manifest/gencode invocation gets a private `__messages_out`
//! file; its lines are re-emitted into the run's global messages file,
//! prefixed with `<type>/<id>:`. A lock over the global file guards the
//! append-merge the way spec §5 describes ("a lock over the global messages
//! file guards append-merge of per-invocation out files").

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// The run-wide messages sink. A single `Mutex` models the append lock from
/// spec §5 — in this engine's async-task concurrency model that is the
/// direct replacement for the original's file lock across forked workers.
pub struct MessageLog {
    path: std::path::PathBuf,
    lock: Mutex<()>,
}

impl MessageLog {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path exported to invocations as `__messages_in`: the global log is
    /// append-only, so callers may read it directly without racing the lock
    /// used by [`Self::merge`].
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge the contents of a per-invocation `__messages_out` file into the
    /// global log, prefixing each line with `<object_name>:`.
    pub fn merge(&self, object_name: &str, messages_out: &Path) -> std::io::Result<()> {
        if !messages_out.is_file() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(messages_out)?;
        if contents.trim().is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in contents.lines() {
            writeln!(file, "{object_name}: {line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn merges_and_prefixes_lines() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("messages");
        let out_path = dir.path().join("out");
        std::fs::write(&out_path, "hello\nworld\n").unwrap();

        let log = MessageLog::new(&log_path);
        log.merge("__planet/earth", &out_path).unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "__planet/earth: hello\n__planet/earth: world\n");
    }

    #[test]
    fn missing_out_file_is_a_no_op() {
        let dir = tempdir().unwrap();
        let log = MessageLog::new(dir.path().join("messages"));
        log.merge("__planet/earth", &dir.path().join("absent")).unwrap();
        assert!(!dir.path().join("messages").exists());
    }
}
