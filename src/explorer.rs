//! Explorer subsystem (spec §4.4).
//!
//! Global explorers run once per run; type explorers are transferred to a
//! type-scoped remote path at most once per run (invariant 6), tracked here
//! by a `HashSet<String>` of type names populated in the parent process
//! before fan-out, mirroring spec §9's "populated in the parent before
//! fanning out" guidance for per-type memoisation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio_stream::wrappers::ReadDirStream;

use crate::error::TransportError;
use crate::model::{Object, Type};
use crate::transport::{Command, Transport};

/// Environment common to both explorer kinds (spec §4.4: "fixed environment
/// ...and `LANG=LC_ALL=C`").
fn base_env(target_host: &str, global_explorer_out: &str, files_path: &str) -> Vec<(String, String)> {
    vec![
        ("__target_host".to_string(), target_host.to_string()),
        ("__global".to_string(), global_explorer_out.to_string()),
        ("__files".to_string(), files_path.to_string()),
        ("LANG".to_string(), "C".to_string()),
        ("LC_ALL".to_string(), "C".to_string()),
    ]
}

/// Filter out hidden entries (leading dot, trailing tilde) before transfer,
/// per spec §4.4.
pub fn is_transferable(name: &str) -> bool {
    !name.starts_with('.') && !name.ends_with('~')
}

pub struct ExplorerRunner {
    remote_global_dir: String,
    remote_type_dir_base: String,
    transferred_types: HashSet<String>,
}

impl ExplorerRunner {
    pub fn new(remote_global_dir: impl Into<String>, remote_type_dir_base: impl Into<String>) -> Self {
        Self {
            remote_global_dir: remote_global_dir.into(),
            remote_type_dir_base: remote_type_dir_base.into(),
            transferred_types: HashSet::new(),
        }
    }

    fn remote_type_dir(&self, type_name: &str) -> String {
        format!("{}/{}", self.remote_type_dir_base, type_name)
    }

    /// Transfer and run all global explorers, returning their outputs keyed
    /// by explorer name.
    pub async fn run_global(
        &mut self,
        transport: &dyn Transport,
        local_dir: &Path,
        target_host: &str,
        files_path: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, TransportError> {
        transport.mkdir(&self.remote_global_dir).await?;
        let mut results = BTreeMap::new();
        if !local_dir.is_dir() {
            return Ok(results);
        }
        let mut entries = ReadDirStream::new(tokio::fs::read_dir(local_dir).await?);
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_transferable(&name) {
                continue;
            }
            let remote_path = format!("{}/{}", self.remote_global_dir, name);
            transport.transfer(&entry.path(), &remote_path).await?;
            let env = base_env(target_host, &self.remote_global_dir, files_path);
            let cmd = Command::new(remote_path);
            let result = transport.run(&cmd.env_vec(env), true).await?;
            results.insert(name, result.stdout);
        }
        Ok(results)
    }

    /// Transfer (at most once per run per type) and run a type's explorers
    /// for a specific object, returning outputs keyed by explorer name.
    pub async fn run_for_object(
        &mut self,
        transport: &dyn Transport,
        ty: &Type,
        object: &Object,
        target_host: &str,
        global_explorer_out: &str,
        files_path: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, TransportError> {
        let remote_dir = self.remote_type_dir(&ty.name);
        if self.transferred_types.insert(ty.name.clone()) {
            transport.mkdir(&remote_dir).await?;
            let local_explorer_dir = ty.path.join("explorer");
            if local_explorer_dir.is_dir() {
                let mut entries = ReadDirStream::new(tokio::fs::read_dir(&local_explorer_dir).await?);
                while let Some(entry) = entries.next().await {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !is_transferable(&name) {
                        continue;
                    }
                    transport
                        .transfer(&entry.path(), &format!("{remote_dir}/{name}"))
                        .await?;
                }
            }
        }

        let mut env = base_env(target_host, global_explorer_out, files_path);
        for (key, values) in &object.parameters {
            env.push((format!("__object_param_{key}"), values.join("\n")));
        }
        env.push(("__object_id".to_string(), object.id.clone()));
        env.push(("__object_name".to_string(), object.name.clone()));
        env.push(("__type".to_string(), ty.name.clone()));

        let mut results = BTreeMap::new();
        for name in &ty.explorers {
            let cmd = Command::new(format!("{remote_dir}/{name}")).env_vec(env.clone());
            let result = transport.run(&cmd, true).await?;
            results.insert(name.clone(), result.stdout);
        }
        Ok(results)
    }

    /// True once a type's explorers have been transferred this run
    /// (invariant 6, exposed for tests).
    pub fn has_transferred(&self, type_name: &str) -> bool {
        self.transferred_types.contains(type_name)
    }
}

impl Command {
    fn env_vec(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Persist explorer output into `<object_dir>/explorer/<name>`.
pub fn store_object_explorer_output(object_dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let dir = object_dir.join("explorer");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(name), data)
}

/// Persist global explorer output into `<work_dir>/explorer/<name>`.
pub fn store_global_explorer_output(work_dir: &Path, name: &str, data: &[u8]) -> std::io::Result<()> {
    let dir = work_dir.join("explorer");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(name), data)
}

pub fn global_explorer_dir(conf_dir: &Path) -> PathBuf {
    conf_dir.join("explorer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_and_backup_entries_are_not_transferable() {
        assert!(!is_transferable(".hidden"));
        assert!(!is_transferable("backup~"));
        assert!(is_transferable("os"));
    }
}
