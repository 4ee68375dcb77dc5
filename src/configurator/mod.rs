//! Configurator — the core loop (spec §4.7).
//!
//! ```text
//! init filesystem layout, symlink conf overlay, link emulators
//! transfer & run global explorers
//! run initial manifest (captures first wave of objects)
//! loop:
//!     (cycle?, path) = validate_dependencies(objects in states != DONE)
//!     if cycle: fail with UnresolvableRequirements(path)
//!     changed = iterate_once()
//!     if not changed: break
//! assert all objects are DONE else fail with UnresolvableRequirements
//! run cleanup commands (e.g. SSH control-master exit)
//! save cache
//! ```
//!
//! Concurrency here is async tasks fanned out with `futures::future::join_all`
//! rather than forked OS processes (spec §9's explicit license: "a
//! thread/task pool...provided no module holds process-global mutable
//! state"). The [`ObjectStore`] is the one piece of mutable run state and is
//! threaded through as `tokio::sync::Mutex<ObjectStore>`, never a static.

pub mod scheduler;

use std::collections::HashMap;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::code;
use crate::error::ConfiguratorError;
use crate::explorer::ExplorerRunner;
use crate::manifest::ManifestEnv;
use crate::messaging::MessageLog;
use crate::model::object::{ObjectState, RequirementKind};
use crate::model::{ObjectStore, TypeRegistry};
use crate::transport::Transport;

/// Settings the loop needs that don't belong to any one subsystem.
///
/// `store` and `explorers` are the only mutable run state; both sit behind
/// an async mutex so Phase A/B fan-out (several `prepare_object`/`run_code`
/// futures alive at once) can borrow `ConfiguratorContext` shared instead of
/// needing one `&mut` per concurrent task.
pub struct ConfiguratorContext<'a> {
    pub types: &'a TypeRegistry,
    pub store: AsyncMutex<ObjectStore>,
    pub explorers: AsyncMutex<ExplorerRunner>,
    pub transport: &'a dyn Transport,
    pub jobs: usize,
    pub dry_run: bool,
    pub target_host: String,
    pub global_explorer_out: String,
    pub files_path: String,
    /// Conf dirs overlay and local work dir, threaded into every manifest
    /// invocation's environment so a reentrant emulator subprocess can
    /// rediscover the type registry and reopen the object store (spec §5).
    pub conf_dirs: Vec<std::path::PathBuf>,
    pub work_dir: std::path::PathBuf,
    pub object_marker: String,
    pub emulator_bin_dir: std::path::PathBuf,
    /// Global messages sink, merged from each object's per-invocation
    /// `__messages_out` file after its manifest and gencode runs (spec
    /// §4.9).
    pub messages: MessageLog,
    /// Cancelled by the signal watcher on `SIGINT`/`SIGTERM`/`SIGHUP` (spec
    /// §5 "Cancellation"). Checked once per fixed-point iteration rather
    /// than inside an in-flight manifest/gencode call.
    pub cancellation: CancellationToken,
}

/// Run the fixed-point loop to completion (spec §4.7's `loop:` block).
///
/// Returns the number of iterations performed, or a [`ConfiguratorError`] on
/// cycle detection or a stuck fixed point.
pub async fn run(ctx: &ConfiguratorContext<'_>) -> Result<usize, ConfiguratorError> {
    let max_iterations = {
        let store = ctx.store.lock().await;
        store.names().len().max(1)
    };

    let mut iterations = 0;
    loop {
        if ctx.cancellation.is_cancelled() {
            return Err(ConfiguratorError::Interrupted);
        }

        {
            let store = ctx.store.lock().await;
            let unfinished: Vec<_> = store
                .iter()
                .filter(|o| o.state != ObjectState::Done)
                .map(|o| o.name.clone())
                .collect();
            if let Some(path) = detect_cycle(&store, &unfinished) {
                return Err(ConfiguratorError::Cycle(path.join(" -> ")));
            }
        }

        let changed = if ctx.jobs <= 1 {
            iterate_once_sequential(ctx).await?
        } else {
            iterate_once_parallel(ctx).await?
        };

        iterations += 1;
        if !changed {
            break;
        }
        if iterations > max_iterations * 4 {
            // Defensive bound; a correct acyclic graph reaches a fixed point
            // in at most |objects| iterations (spec §8 property 7). This
            // only trips if new objects keep appearing indefinitely.
            break;
        }
    }

    let store = ctx.store.lock().await;
    let stuck: Vec<_> = store
        .iter()
        .filter(|o| o.state != ObjectState::Done)
        .map(|o| o.name.clone())
        .collect();
    if !stuck.is_empty() {
        return Err(ConfiguratorError::StuckObjects {
            count: stuck.len(),
            names: stuck.join(", "),
        });
    }

    Ok(iterations)
}

/// DFS cycle detection over the union of explicit and autorequire edges
/// (spec §4.7 "Cycle detection").
fn detect_cycle(store: &ObjectStore, roots: &[String]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InStack,
        Done,
    }

    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit(
        store: &ObjectStore,
        node: &str,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if marks.get(node) == Some(&Mark::Done) {
            return None;
        }

        stack.push(node.to_string());

        let edges: Vec<String> = store
            .get(node)
            .map(|o| {
                o.requirement_set(RequirementKind::Explicit)
                    .iter()
                    .chain(o.requirement_set(RequirementKind::Autorequire).iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for edge in edges {
            for target in store.resolve_pattern(&edge) {
                if let Some(cycle) = visit(store, &target, marks, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
        None
    }

    for root in roots {
        if let Some(cycle) = visit(store, root, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Sequential `iterate_once` (spec §4.7).
async fn iterate_once_sequential(ctx: &ConfiguratorContext<'_>) -> Result<bool, ConfiguratorError> {
    let mut changed = false;
    let names: Vec<String> = {
        let store = ctx.store.lock().await;
        store.names()
    };

    for name in names {
        let (state, explicit_unfinished) = {
            let store = ctx.store.lock().await;
            let Ok(object) = store.get(&name) else { continue };
            (
                object.state,
                store.is_unfinished(object.requirement_set(RequirementKind::Explicit)),
            )
        };

        if explicit_unfinished {
            continue;
        }

        if state == ObjectState::Undef {
            prepare_object(ctx, &name).await?;
            changed = true;
            continue;
        }

        let autorequire_unfinished = {
            let store = ctx.store.lock().await;
            let Ok(object) = store.get(&name) else { continue };
            store.is_unfinished(object.requirement_set(RequirementKind::Autorequire))
        };
        if autorequire_unfinished {
            continue;
        }

        if state == ObjectState::Prepared {
            run_code(ctx, &name).await?;
            changed = true;
        }
    }

    Ok(changed)
}

/// Parallel `iterate_once`: Phase A (preparation) then Phase B (execution),
/// per spec §4.7.
async fn iterate_once_parallel(ctx: &ConfiguratorContext<'_>) -> Result<bool, ConfiguratorError> {
    let mut changed = false;

    // Phase A: UNDEF objects whose explicit requirements are satisfied.
    let to_prepare: Vec<String> = {
        let store = ctx.store.lock().await;
        store
            .iter()
            .filter(|o| o.state == ObjectState::Undef)
            .filter(|o| !store.is_unfinished(o.requirement_set(RequirementKind::Explicit)))
            .map(|o| o.name.clone())
            .collect()
    };

    if !to_prepare.is_empty() {
        changed = true;
        let jobs = ctx.jobs.max(1);
        for batch in to_prepare.chunks(jobs) {
            let futures = batch.iter().map(|name| prepare_object(ctx, name));
            for result in futures::future::join_all(futures).await {
                result?;
            }
        }
    }

    // Phase B: PREPARED objects whose both requirement sets are satisfied,
    // partitioned so no two objects of the same nonparallel type share a
    // chunk (invariant 7).
    let ready_names: Vec<String> = {
        let store = ctx.store.lock().await;
        store
            .iter()
            .filter(|o| o.state == ObjectState::Prepared)
            .filter(|o| !store.is_unfinished(o.requirement_set(RequirementKind::Explicit)))
            .filter(|o| !store.is_unfinished(o.requirement_set(RequirementKind::Autorequire)))
            .map(|o| o.name.clone())
            .collect()
    };

    if !ready_names.is_empty() {
        changed = true;
        let store = ctx.store.lock().await;
        let objects: Vec<_> = ready_names.iter().filter_map(|n| store.get(n).ok()).collect();
        let chunks = scheduler::partition_nonparallel(&objects, |ty| ctx.types.get(ty).ok());
        let chunk_names: Vec<Vec<String>> = chunks
            .into_iter()
            .map(|c| c.into_iter().map(|o| o.name.clone()).collect())
            .collect();
        drop(store);

        for chunk in chunk_names {
            let futures = chunk.iter().map(|name| run_code(ctx, name));
            for result in futures::future::join_all(futures).await {
                result?;
            }
        }
    }

    Ok(changed)
}

/// `UNDEF -> PREPARED`: run the object's type explorers then its type
/// manifest (spec §3 state machine, §4.4, §4.5).
async fn prepare_object(ctx: &ConfiguratorContext<'_>, name: &str) -> Result<(), ConfiguratorError> {
    let (type_name, object_snapshot, object_dir) = {
        let store = ctx.store.lock().await;
        let object = store.get(name)?;
        (object.type_name.clone(), object.clone(), store.object_disk_path(name)?)
    };
    let ty = ctx.types.get(&type_name)?;

    let outputs = {
        let mut explorers = ctx.explorers.lock().await;
        explorers
            .run_for_object(
                ctx.transport,
                ty,
                &object_snapshot,
                &ctx.target_host,
                &ctx.global_explorer_out,
                &ctx.files_path,
            )
            .await?
    };
    for (explorer_name, data) in &outputs {
        crate::explorer::store_object_explorer_output(&object_dir, explorer_name, data)
            .map_err(|source| ConfiguratorError::Entity {
                object: name.to_string(),
                source: source.into(),
                stdout_path: None,
                stderr_path: None,
            })?;
    }

    if ty.has_manifest {
        let stdout_path = object_dir.join("stdout").join("manifest");
        let stderr_path = object_dir.join("stderr").join("manifest");
        let messages_out = object_dir.join("messages_out");
        let env = ManifestEnv {
            emulator_bin_dir: ctx.emulator_bin_dir.clone(),
            target_host: ctx.target_host.clone(),
            target_hostname: ctx.target_host.clone(),
            target_fqdn: ctx.target_host.clone(),
            global_explorer_out: std::path::PathBuf::from(&ctx.global_explorer_out),
            type_base_path: ty.path.clone(),
            manifest_path: ty.manifest_path(),
            files_path: ty.files_path(),
            object_marker: ctx.object_marker.clone(),
            log_level: "INFO".to_string(),
            order_dep_file: object_dir.join("order_dep"),
            conf_dirs: ctx.conf_dirs.clone(),
            work_dir: ctx.work_dir.clone(),
            messages_in: ctx.messages.path().to_path_buf(),
            messages_out: messages_out.clone(),
        };
        let vars = env.type_vars(&object_dir, &object_snapshot.id, name, &type_name);
        let ok = crate::manifest::run_manifest(&ty.manifest_path(), "/bin/sh", &vars, &stdout_path, &stderr_path)
            .await
            .map_err(|e| ConfiguratorError::Entity {
                object: name.to_string(),
                source: e.into(),
                stdout_path: Some(stdout_path.clone()),
                stderr_path: Some(stderr_path.clone()),
            })?;
        ctx.messages.merge(name, &messages_out).map_err(|e| ConfiguratorError::Entity {
            object: name.to_string(),
            source: e.into(),
            stdout_path: None,
            stderr_path: None,
        })?;
        if !ok {
            return Err(ConfiguratorError::Entity {
                object: name.to_string(),
                source: anyhow::anyhow!("manifest exited non-zero"),
                stdout_path: Some(stdout_path),
                stderr_path: Some(stderr_path),
            });
        }
    }

    let mut store = ctx.store.lock().await;
    // Pick up objects and autorequire edges the manifest's emulator
    // subprocesses wrote directly to disk (spec §5).
    store
        .reload_from_disk()
        .map_err(|e| ConfiguratorError::Entity { object: name.to_string(), source: e.into(), stdout_path: None, stderr_path: None })?;
    store.set_state(name, ObjectState::Prepared);
    store
        .sync_to_disk(name)
        .map_err(|e| ConfiguratorError::Entity { object: name.to_string(), source: e.into(), stdout_path: None, stderr_path: None })?;
    Ok(())
}

/// `PREPARED -> DONE`: gencode, transfer, execute (spec §4.6).
async fn run_code(ctx: &ConfiguratorContext<'_>, name: &str) -> Result<(), ConfiguratorError> {
    let (type_name, object_dir) = {
        let store = ctx.store.lock().await;
        (store.get(name)?.type_name.clone(), store.object_disk_path(name)?)
    };
    let ty = ctx.types.get(&type_name)?;

    let mut changed = false;

    let messages_in = ctx.messages.path().to_string_lossy().into_owned();

    let local_messages_out = object_dir.join("messages_out_gencode_local");
    let local_env = vec![
        ("__messages_in".to_string(), messages_in.clone()),
        ("__messages_out".to_string(), local_messages_out.to_string_lossy().into_owned()),
    ];
    if let Some(local_code) = code::run_gencode(ctx.transport, &ty.gencode_local_path(), &local_env).await? {
        changed = true;
        code::execute_artifact(ctx.transport, &local_code, &local_env, ctx.dry_run).await?;
        std::fs::write(object_dir.join("code-local"), &local_code).ok();
    }
    ctx.messages
        .merge(name, &local_messages_out)
        .map_err(|e| ConfiguratorError::Entity { object: name.to_string(), source: e.into(), stdout_path: None, stderr_path: None })?;

    let remote_messages_out = object_dir.join("messages_out_gencode_remote");
    let remote_env = vec![
        ("__messages_in".to_string(), messages_in),
        ("__messages_out".to_string(), remote_messages_out.to_string_lossy().into_owned()),
    ];
    if let Some(remote_code) = code::run_gencode(ctx.transport, &ty.gencode_remote_path(), &remote_env).await? {
        changed = true;
        let remote_object_dir = format!("/var/lib/skonfig/object/{name}");
        code::run_remote_artifact(ctx.transport, &remote_code, &remote_object_dir, &remote_env, ctx.dry_run).await?;
        std::fs::write(object_dir.join("code-remote"), &remote_code).ok();
    }
    ctx.messages
        .merge(name, &remote_messages_out)
        .map_err(|e| ConfiguratorError::Entity { object: name.to_string(), source: e.into(), stdout_path: None, stderr_path: None })?;

    let mut store = ctx.store.lock().await;
    store.set_changed(name, changed);
    store.set_state(name, ObjectState::Done);
    store
        .sync_to_disk(name)
        .map_err(|e| ConfiguratorError::Entity { object: name.to_string(), source: e.into(), stdout_path: None, stderr_path: None })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::type_registry::Type;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn bare_type(name: &str) -> Type {
        Type {
            name: name.to_string(),
            path: PathBuf::from("/dev/null"),
            parameters: Vec::new(),
            explorers: Vec::new(),
            has_manifest: false,
            has_gencode_local: false,
            has_gencode_remote: false,
            singleton: false,
            install: false,
            nonparallel: false,
            deprecated: None,
        }
    }

    #[test]
    fn cycle_detection_reports_a_concrete_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let a = bare_type("__a");
        let b = bare_type("__b");
        let c = bare_type("__c");

        store.declare(&a, "1", BTreeMap::new(), vec!["__b/1".into()], "m".into(), false).unwrap();
        store.declare(&b, "1", BTreeMap::new(), vec!["__c/1".into()], "m".into(), false).unwrap();
        store.declare(&c, "1", BTreeMap::new(), vec!["__a/1".into()], "m".into(), false).unwrap();

        let roots = store.names();
        let cycle = detect_cycle(&store, &roots).expect("cycle must be detected");
        assert!(cycle.len() >= 4);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn acyclic_graph_detects_no_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let a = bare_type("__a");
        let b = bare_type("__b");

        store.declare(&a, "1", BTreeMap::new(), vec!["__b/1".into()], "m".into(), false).unwrap();
        store.declare(&b, "1", BTreeMap::new(), vec![], "m".into(), false).unwrap();

        let roots = store.names();
        assert!(detect_cycle(&store, &roots).is_none());
    }
}
