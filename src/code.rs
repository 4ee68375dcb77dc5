//! Code subsystem (spec §4.6).
//!
//! For each prepared object, runs `gencode-local`/`gencode-remote` if
//! present and captures the output to a generated code artifact. A
//! non-empty artifact on either side marks the object *changed*. Remote
//! code is transferred to a deterministic path under the object on the
//! remote and executed through the transport; local code runs directly.
//! Dry-run suppresses *execution* of the artifacts, not gencode itself.

use std::path::{Path, PathBuf};

use crate::error::TransportError;
use crate::transport::{Command, Transport};

/// Concatenate a gencode target (file or directory) into a single script.
///
/// A directory with an `init` entry runs only `init`; otherwise all entries
/// are concatenated in sorted byte order, matching `sorted(os.listdir())` in
/// the original engine (spec §4.6 supplemental behavior).
pub fn resolve_gencode_script(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    if path.is_file() {
        return Ok(Some(path.to_path_buf()));
    }
    let init = path.join("init");
    if init.is_file() {
        return Ok(Some(init));
    }
    Ok(Some(path.to_path_buf()))
}

/// Build the effective script text for a gencode target, concatenating a
/// directory's entries in sorted order if it isn't a single file or `init`.
pub fn build_gencode_source(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    if path.is_file() {
        return Ok(Some(std::fs::read(path)?));
    }
    let init = path.join("init");
    if init.is_file() {
        return Ok(Some(std::fs::read(init)?));
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    let mut out = Vec::new();
    for entry in entries {
        out.extend(std::fs::read(entry)?);
        out.push(b'\n');
    }
    Ok(Some(out))
}

/// Run a gencode target and capture its stdout as the generated artifact,
/// with a trailing newline enforced (spec §4.6).
pub async fn run_gencode(
    transport: &dyn Transport,
    gencode_path: &Path,
    env: &[(String, String)],
) -> Result<Option<Vec<u8>>, TransportError> {
    let Some(source) = build_gencode_source(gencode_path).map_err(TransportError::Io)? else {
        return Ok(None);
    };
    if source.trim_ascii().is_empty() {
        return Ok(None);
    }

    let script_dir = tempfile::tempdir().map_err(TransportError::Io)?;
    let script_path = script_dir.path().join("gencode");
    std::fs::write(&script_path, &source).map_err(TransportError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .map_err(TransportError::Io)?;
    }

    let result = transport.run_script(&script_path, env, true).await?;
    let mut artifact = result.stdout;
    if artifact.is_empty() {
        return Ok(None);
    }
    if !artifact.ends_with(b"\n") {
        artifact.push(b'\n');
    }
    Ok(Some(artifact))
}

/// Execute a previously generated code artifact via `transport`, unless
/// `dry_run` suppresses it (spec §4.6: "Dry-run suppresses execution of the
/// artifacts but still runs gencode").
pub async fn execute_artifact(
    transport: &dyn Transport,
    artifact: &[u8],
    env: &[(String, String)],
    dry_run: bool,
) -> Result<(), TransportError> {
    if dry_run {
        return Ok(());
    }
    let script_dir = tempfile::tempdir().map_err(TransportError::Io)?;
    let script_path = script_dir.path().join("code");
    std::fs::write(&script_path, artifact).map_err(TransportError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .map_err(TransportError::Io)?;
    }
    transport.run_script(&script_path, env, false).await?;
    Ok(())
}

/// Transfer a local code artifact to the deterministic remote path for an
/// object and execute it there.
pub async fn run_remote_artifact(
    transport: &dyn Transport,
    artifact: &[u8],
    remote_object_dir: &str,
    env: &[(String, String)],
    dry_run: bool,
) -> Result<(), TransportError> {
    let remote_path = format!("{remote_object_dir}/code-remote");
    let staging = tempfile::tempdir().map_err(TransportError::Io)?;
    let local_copy = staging.path().join("code-remote");
    std::fs::write(&local_copy, artifact).map_err(TransportError::Io)?;
    transport.transfer(&local_copy, &remote_path).await?;
    if dry_run {
        return Ok(());
    }
    let mut cmd = Command::new(remote_path);
    cmd.env.extend(env.iter().cloned());
    transport.run(&cmd, false).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn concatenates_directory_entries_in_sorted_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("20-second"), b"second").unwrap();
        std::fs::write(dir.path().join("10-first"), b"first").unwrap();
        let source = build_gencode_source(dir.path()).unwrap().unwrap();
        let text = String::from_utf8(source).unwrap();
        assert!(text.find("first").unwrap() < text.find("second").unwrap());
    }

    #[test]
    fn prefers_init_entry_when_present() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("init"), b"only-this").unwrap();
        std::fs::write(dir.path().join("other"), b"not-this").unwrap();
        let source = build_gencode_source(dir.path()).unwrap().unwrap();
        assert_eq!(source, b"only-this");
    }

    #[test]
    fn missing_target_yields_none() {
        let dir = tempdir().unwrap();
        assert!(build_gencode_source(&dir.path().join("absent")).unwrap().is_none());
    }
}
