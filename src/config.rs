//! Run settings.
//!
//! Deliberately narrow per the Out-of-scope list in spec §1 ("CLI argument
//! parsing, settings/config-file loading...are external collaborators with
//! narrow interfaces") — this struct only carries what the core modules
//! need, loaded via `serde`+`toml` the way the rest of this crate's ambient
//! stack is built.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_jobs() -> usize {
    1
}

fn default_remote_exec() -> String {
    "ssh -o User=root".to_string()
}

fn default_remote_copy() -> String {
    "scp -o User=root".to_string()
}

fn default_cache_path_pattern() -> String {
    "%h".to_string()
}

/// A fresh per-run marker when the settings file doesn't pin one, so two
/// runs sharing an `out_path` never mistake one's object directories for
/// the other's (spec §3: "configurable...per run").
fn default_object_marker() -> String {
    format!(".cdist-{}", uuid::Uuid::new_v4().simple())
}

fn default_archiving() -> bool {
    true
}

fn default_remote_shell() -> String {
    "/bin/sh".to_string()
}

/// Engine-wide settings for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Conf dirs to overlay, in increasing precedence (spec §4.2: "last
    /// conf-dir wins").
    pub conf_dirs: Vec<PathBuf>,

    /// Local working directory root; `<out_path>/<host>` holds the per-run
    /// tree described in spec §6.
    pub out_path: PathBuf,

    /// Directory under which finished runs are archived (spec §4.8).
    pub cache_path_root: PathBuf,

    /// `strftime`/placeholder pattern for the cache destination (spec §4.8):
    /// `%h` host hash, `%N` host string, `%P` pid, plus strftime codes.
    #[serde(default = "default_cache_path_pattern")]
    pub cache_path_pattern: String,

    /// Maximum parallel workers for the configurator (spec §4.7, §5).
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Command used to reach the remote host, `ssh`-shaped (spec §4.1).
    #[serde(default = "default_remote_exec")]
    pub remote_exec: String,

    /// Command used to copy individual files/archives to the remote
    /// (spec §4.1).
    #[serde(default = "default_remote_copy")]
    pub remote_copy: String,

    /// Shell used to run scripts without the executable bit set
    /// (spec §4.1 `run_script`).
    #[serde(default = "default_remote_shell")]
    pub remote_shell: String,

    /// Per-run random (or test-pinned) marker distinguishing object
    /// directories (spec §3, §6).
    #[serde(default = "default_object_marker")]
    pub object_marker: String,

    /// Whether directory transfers may be archived (spec §4.1 policy);
    /// the files-limit threshold itself is not configurable.
    #[serde(default = "default_archiving")]
    pub archiving_enabled: bool,

    /// Suppress execution of gencode artifacts while still running gencode
    /// itself (spec §4.6 "Dry-run").
    #[serde(default)]
    pub dry_run: bool,

    /// Run in install mode: `install`-flagged types participate in the
    /// object set (spec §4.2 supplemental behavior); config mode skips
    /// objects sourced exclusively from install-marked types at the top
    /// level.
    #[serde(default)]
    pub install_mode: bool,
}

impl Settings {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let mut settings: Settings = toml::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        settings.expand_paths();
        Ok(settings)
    }

    /// Tilde-expand user-facing path fields, so `out_path = "~/.skonfig"` in
    /// the settings file resolves the way a shell would.
    fn expand_paths(&mut self) {
        self.out_path = expand_tilde(&self.out_path);
        self.cache_path_root = expand_tilde(&self.cache_path_root);
        for dir in &mut self.conf_dirs {
            *dir = expand_tilde(dir);
        }
    }

    /// A target-specific view with the host baked in, passed down to the
    /// transport and cache layers.
    pub fn for_host(&self, host: String) -> HostSettings {
        HostSettings {
            host: host.clone(),
            work_dir: self.out_path.join(sanitize_host(&host)),
            settings: self.clone(),
        }
    }
}

/// Settings specialised for a single target host.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub host: String,
    pub work_dir: PathBuf,
    pub settings: Settings,
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_ipv6_host_for_directory_name() {
        assert_eq!(sanitize_host("::1"), "__1");
        assert_eq!(sanitize_host("example.com"), "example.com");
    }

    #[test]
    fn expands_tilde_in_loaded_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("skonfig.toml");
        std::fs::write(&settings_path, "conf_dirs = [\"~/conf\"]\nout_path = \"~/.skonfig\"\ncache_path_root = \"~/.skonfig/cache\"\n").unwrap();

        let settings = Settings::load(&settings_path).unwrap();
        assert!(!settings.out_path.to_string_lossy().starts_with('~'));
        assert!(!settings.conf_dirs[0].to_string_lossy().starts_with('~'));
    }
}
