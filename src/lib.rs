//! skonfig — an agentless configuration management engine.
//!
//! A target host is described by a tree of *types* (reusable configuration
//! primitives, `__name` directories under a conf dir) and *manifests*
//! (shell scripts that instantiate types for a given host). This crate
//! discovers the host's current state via *explorers*, expands manifests
//! into a graph of *objects* through a reentrant *emulator*, drives that
//! graph to a fixed point through the *configurator*, and finally archives
//! the completed run into a cache.
//!
//! ```text
//! conf dirs --> TypeRegistry --> initial manifest --> ObjectStore
//!                                      |                   |
//!                                      v                   v
//!                                  emulator  <---  configurator (fixed point)
//!                                                       |        |
//!                                                  explorers   code
//!                                                       |        |
//!                                                       v        v
//!                                                    Transport (local/remote)
//! ```
//!
//! Everything that crosses a shell boundary goes through [`quoting`]; every
//! directory transfer goes through [`archive`]'s files-limit policy;
//! everything that touches the target goes through [`transport::Transport`].

pub mod archive;
pub mod cache;
pub mod code;
pub mod config;
pub mod configurator;
pub mod emulator;
pub mod error;
pub mod explorer;
pub mod manifest;
pub mod messaging;
pub mod model;
pub mod quoting;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::HostSettings;
use crate::configurator::ConfiguratorContext;
use crate::error::Result;
use crate::explorer::ExplorerRunner;
use crate::manifest::ManifestEnv;
use crate::messaging::MessageLog;
use crate::model::{ObjectStore, TypeRegistry};
use crate::transport::local::LocalTransport;
use crate::transport::remote::RemoteTransport;
use crate::transport::Transport;

/// Directory (under the per-host work dir) that the type emulators are
/// symlinked into, so a manifest's own `PATH` lookup for `__planet` etc.
/// reaches back into this binary under a different `argv[0]` (spec §4.3).
pub const EMULATOR_BIN_DIR_NAME: &str = "bin";

/// The full set of run-scoped collaborators, replacing what the original
/// engine kept as process-global state (spec §9). Built once per run by
/// [`run`] and handed to the configurator; nothing in this crate reaches
/// for a static beyond it.
pub struct Runtime {
    pub host: HostSettings,
    pub transport: Box<dyn Transport>,
    pub types: TypeRegistry,
    pub store: ObjectStore,
    pub started_at: chrono::DateTime<Utc>,
    pub pid: u32,
    /// Cancelled by [`spawn_signal_watcher`] on `SIGINT`/`SIGTERM`/`SIGHUP`
    /// (spec §5 "Cancellation").
    pub cancellation: CancellationToken,
}

/// Cancel `token` on `Ctrl-C`, `SIGTERM`, or `SIGHUP` (spec §5: "Keyboard
/// interrupt or fatal signal in the parent process kills the entire process
/// group"). This crate's workers are async tasks rather than forked
/// children, so cancellation here means the fixed-point loop stops at its
/// next iteration boundary instead of a literal `killpg`.
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = hup.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}

impl Runtime {
    /// Discover types, open (or create) the per-host object store, and pick
    /// a transport peer for `host` (local if it names this machine's own
    /// well-known loopback alias, remote otherwise).
    pub fn new(host: String, settings: &config::Settings) -> Result<Self> {
        let host_settings = settings.for_host(host.clone());
        std::fs::create_dir_all(&host_settings.work_dir)?;

        let types = TypeRegistry::discover(&settings.conf_dirs)?;
        let store = ObjectStore::open(host_settings.work_dir.clone(), settings.object_marker.clone())?;

        let transport: Box<dyn Transport> = if host == "localhost" || host == "127.0.0.1" {
            Box::new(LocalTransport::new(settings.remote_shell.clone()))
        } else {
            Box::new(RemoteTransport::new(
                host,
                settings.remote_exec.clone(),
                settings.remote_copy.clone(),
                settings.remote_shell.clone(),
                settings.archiving_enabled,
            ))
        };

        Ok(Self {
            host: host_settings,
            transport,
            types,
            store,
            started_at: Utc::now(),
            pid: std::process::id(),
            cancellation: CancellationToken::new(),
        })
    }

    fn emulator_bin_dir(&self) -> PathBuf {
        self.host.work_dir.join(EMULATOR_BIN_DIR_NAME)
    }

    /// Symlink every discovered type's name into [`Self::emulator_bin_dir`],
    /// pointing at this running binary, so manifests can invoke `__planet`
    /// etc. as a plain command (spec §4.3's reentrant-binary trick).
    fn link_emulators(&self) -> Result<()> {
        let bin_dir = self.emulator_bin_dir();
        std::fs::create_dir_all(&bin_dir)?;
        let exe = std::env::current_exe()?;
        for ty in self.types.iter() {
            let link = bin_dir.join(&ty.name);
            if link.exists() {
                continue;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&exe, &link)?;
            #[cfg(not(unix))]
            std::fs::copy(&exe, &link).map(|_| ())?;
        }
        Ok(())
    }

    fn initial_manifest_env(&self, messages_in: &std::path::Path) -> ManifestEnv {
        ManifestEnv {
            emulator_bin_dir: self.emulator_bin_dir(),
            target_host: self.host.host.clone(),
            target_hostname: self.host.host.clone(),
            target_fqdn: self.host.host.clone(),
            global_explorer_out: self.host.work_dir.join("explorer"),
            type_base_path: self.host.work_dir.clone(),
            manifest_path: self.host.work_dir.join("manifest").join("init"),
            files_path: self.host.work_dir.clone(),
            object_marker: self.host.settings.object_marker.clone(),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            order_dep_file: self.host.work_dir.join(".order_dep"),
            conf_dirs: self.host.settings.conf_dirs.clone(),
            work_dir: self.host.work_dir.clone(),
            messages_in: messages_in.to_path_buf(),
            messages_out: self.host.work_dir.join("messages_out_init"),
        }
    }

    /// Run the full pipeline for one host: link emulators, run global
    /// explorers, run the initial manifest, drive the configurator to a
    /// fixed point, persist into the cache (spec §4.7's top-level sequence).
    pub async fn run(mut self, initial_manifest: &std::path::Path) -> Result<usize> {
        spawn_signal_watcher(self.cancellation.clone());
        self.link_emulators()?;

        let remote_global_dir = format!("{}/explorer", self.host.work_dir.display());
        let remote_type_dir_base = format!("{}/type", self.host.work_dir.display());
        let mut explorers = ExplorerRunner::new(remote_global_dir.clone(), remote_type_dir_base);

        let global_explorer_dir = explorer::global_explorer_dir(
            self.host
                .settings
                .conf_dirs
                .first()
                .map(|p| p.as_path())
                .unwrap_or_else(|| std::path::Path::new(".")),
        );
        let global_outputs = explorers
            .run_global(self.transport.as_ref(), &global_explorer_dir, &self.host.host, &self.host.work_dir.to_string_lossy())
            .await?;
        for (name, data) in &global_outputs {
            explorer::store_global_explorer_output(&self.host.work_dir, name, data)?;
        }

        let messages = MessageLog::new(self.host.work_dir.join("messages"));
        std::fs::write(messages.path(), "").ok();

        if initial_manifest.is_file() {
            let env = self.initial_manifest_env(messages.path());
            let vars = env.base_vars();
            let stdout_path = self.host.work_dir.join("stdout").join("init");
            let stderr_path = self.host.work_dir.join("stderr").join("init");
            std::fs::create_dir_all(stdout_path.parent().unwrap())?;
            std::fs::create_dir_all(stderr_path.parent().unwrap())?;
            manifest::run_manifest(initial_manifest, &self.host.settings.remote_shell, &vars, &stdout_path, &stderr_path).await?;
            self.store.reload_from_disk()?;
            messages.merge("init", &env.messages_out)?;
        }

        let ctx = ConfiguratorContext {
            types: &self.types,
            store: AsyncMutex::new(self.store),
            explorers: AsyncMutex::new(explorers),
            transport: self.transport.as_ref(),
            jobs: self.host.settings.jobs,
            dry_run: self.host.settings.dry_run,
            target_host: self.host.host.clone(),
            global_explorer_out: self.host.work_dir.join("explorer").to_string_lossy().into_owned(),
            files_path: self.host.work_dir.to_string_lossy().into_owned(),
            conf_dirs: self.host.settings.conf_dirs.clone(),
            work_dir: self.host.work_dir.clone(),
            object_marker: self.host.settings.object_marker.clone(),
            emulator_bin_dir: self.emulator_bin_dir(),
            messages,
            cancellation: self.cancellation.clone(),
        };

        let iterations = configurator::run(&ctx).await?;
        self.transport.cleanup().await;

        cache::persist(
            &self.host.work_dir,
            &self.host.settings.cache_path_root,
            &self.host.settings.cache_path_pattern,
            &self.host.host,
            self.pid,
            self.started_at,
        )?;

        Ok(iterations)
    }
}

/// Convenience entry point used by `main.rs`'s default subcommand: build a
/// [`Runtime`] for `host` and run it to completion.
pub async fn run_for_host(host: String, settings: Arc<config::Settings>, initial_manifest: PathBuf) -> Result<usize> {
    let runtime = Runtime::new(host, &settings)?;
    runtime.run(&initial_manifest).await
}
