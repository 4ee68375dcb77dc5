//! Manifest subsystem (spec §4.5).
//!
//! Manifests always run locally (the shell author's machine), under an
//! environment that prepends the emulator-link directory to `PATH` so the
//! shell's own name lookup for `__planet`, `__moon`, etc. reaches back into
//! this binary (spec §4.3's reentrant-binary trick). Output/error streams
//! are captured to the object's (or the run's) stdout/stderr directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::TransportError;

/// Fixed environment shared by initial and type manifests (spec §4.5).
pub struct ManifestEnv {
    pub emulator_bin_dir: PathBuf,
    pub target_host: String,
    pub target_hostname: String,
    pub target_fqdn: String,
    pub global_explorer_out: PathBuf,
    pub type_base_path: PathBuf,
    pub manifest_path: PathBuf,
    pub files_path: PathBuf,
    pub object_marker: String,
    pub log_level: String,
    /// Private temp file tracking the last object created in this manifest
    /// process, consumed by `CDIST_ORDER_DEPENDENCY` handling (spec §4.3
    /// step 8); always present so the emulator has somewhere to write even
    /// when order-dependency is off.
    pub order_dep_file: PathBuf,
    /// Conf dirs to overlay, exported so a reentrant emulator invocation
    /// (a separate OS process, spec §5) can rediscover the `TypeRegistry`
    /// rather than share one in memory with the manifest's caller.
    pub conf_dirs: Vec<PathBuf>,
    /// Local working directory for this run, so the emulator subprocess can
    /// open the same on-disk object store the configurator reads from.
    pub work_dir: PathBuf,
    /// Global messages log, exported read-only as `__messages_in` (spec
    /// §4.9).
    pub messages_in: PathBuf,
    /// Per-invocation file this manifest's lines get written to, merged
    /// into the global log by the caller after the process exits.
    pub messages_out: PathBuf,
}

impl ManifestEnv {
    /// Build the variable list for an *initial* manifest invocation.
    pub fn base_vars(&self) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_default();
        vec![
            (
                "PATH".to_string(),
                format!("{}:{}", self.emulator_bin_dir.display(), path),
            ),
            ("__target_host".to_string(), self.target_host.clone()),
            ("__target_hostname".to_string(), self.target_hostname.clone()),
            ("__target_fqdn".to_string(), self.target_fqdn.clone()),
            (
                "__global".to_string(),
                self.global_explorer_out.to_string_lossy().into_owned(),
            ),
            (
                "__cdist_type_base_path".to_string(),
                self.type_base_path.to_string_lossy().into_owned(),
            ),
            (
                "__manifest".to_string(),
                self.manifest_path.to_string_lossy().into_owned(),
            ),
            ("__files".to_string(), self.files_path.to_string_lossy().into_owned()),
            ("__cdist_object_marker".to_string(), self.object_marker.clone()),
            ("__cdist_log_level".to_string(), self.log_level.clone()),
            (
                "__cdist_manifest".to_string(),
                self.order_dep_file.to_string_lossy().into_owned(),
            ),
            (
                "__cdist_conf_dirs".to_string(),
                self.conf_dirs
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(":"),
            ),
            ("__cdist_work_dir".to_string(), self.work_dir.to_string_lossy().into_owned()),
            ("__messages_in".to_string(), self.messages_in.to_string_lossy().into_owned()),
            ("__messages_out".to_string(), self.messages_out.to_string_lossy().into_owned()),
        ]
    }

    /// Additional variables exported only for a *type* manifest (spec §4.5:
    /// "for type manifests additionally exports `__object`, `__object_id`,
    /// `__object_name`, `__type`").
    pub fn type_vars(&self, object_dir: &Path, object_id: &str, object_name: &str, type_name: &str) -> Vec<(String, String)> {
        let mut vars = self.base_vars();
        vars.push(("__object".to_string(), object_dir.to_string_lossy().into_owned()));
        vars.push(("__object_id".to_string(), object_id.to_string()));
        vars.push(("__object_name".to_string(), object_name.to_string()));
        vars.push(("__type".to_string(), type_name.to_string()));
        vars
    }
}

/// Run a manifest script locally, with `extra_env` merged over the base
/// environment, capturing stdout/stderr to the given files.
pub async fn run_manifest(
    script: &Path,
    shell: &str,
    env: &[(String, String)],
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<bool, TransportError> {
    let is_executable = tokio::fs::metadata(script)
        .await
        .map(|m| {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode() & 0o111 != 0
            }
            #[cfg(not(unix))]
            {
                false
            }
        })
        .unwrap_or(false);

    let mut command = if is_executable {
        Command::new(script)
    } else {
        let mut c = Command::new(shell);
        c.arg("-e").arg(script);
        c
    };

    command.env_clear();
    for (k, v) in env {
        command.env(k, v);
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        argv: script.to_string_lossy().into_owned(),
        source,
    })?;

    if let Some(mut out) = child.stdout.take() {
        let mut file = tokio::fs::File::create(stdout_path).await?;
        tokio::io::copy(&mut out, &mut file).await?;
    }
    if let Some(mut err) = child.stderr.take() {
        let mut file = tokio::fs::File::create(stderr_path).await?;
        tokio::io::copy(&mut err, &mut file).await?;
    }
    let status = child.wait().await?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn runs_manifest_and_captures_streams() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("manifest");
        std::fs::write(&script, "#!/bin/sh\necho out\necho err >&2\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let stdout_path = dir.path().join("stdout");
        let stderr_path = dir.path().join("stderr");
        let ok = run_manifest(&script, "/bin/sh", &[], &stdout_path, &stderr_path)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(std::fs::read_to_string(stdout_path).unwrap().trim(), "out");
        assert_eq!(std::fs::read_to_string(stderr_path).unwrap().trim(), "err");
    }
}
