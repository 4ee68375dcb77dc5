//! `skonfig` — driver CLI and reentrant emulator entry point.
//!
//! Dispatch happens on `argv[0]` before any argument parsing, per spec
//! §4.3: if the final path segment starts with `__`, this process *is* an
//! emulator invocation (a manifest calling a type by name); otherwise it's
//! the driver binary and `clap` takes over.

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skonfig::config::Settings;
use skonfig::emulator::{should_capture_stdin, EmulatorEnv, EmulatorInvocation};
use skonfig::error::{ConfiguratorError, EmulatorError, Error};
use skonfig::model::{ObjectStore, TypeRegistry};

#[derive(Parser)]
#[command(name = "skonfig", about = "Agentless configuration management engine driven over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a target host (default mode).
    Config {
        host: String,
        #[arg(long, default_value = "skonfig.toml")]
        settings: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Validate the settings file and exit without contacting the host.
        #[arg(long)]
        check: bool,
    },
    /// Alias for a run in install mode (spec §6, install-flagged types
    /// participate in the initial object set).
    Install {
        host: String,
        #[arg(long, default_value = "skonfig.toml")]
        settings: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

fn argv0_type_name(argv0: &str) -> Option<&str> {
    let base = std::path::Path::new(argv0).file_name()?.to_str()?;
    base.starts_with("__").then_some(base)
}

/// Run as the reentrant emulator (spec §4.3): resolve the called type from
/// `argv[0]`, parse `argv[1:]` and the fixed environment, and record the
/// resulting object directly on disk, since this process shares no memory
/// with the configurator that spawned the manifest calling it (spec §5).
fn run_as_emulator(type_name: &str) -> anyhow::Result<()> {
    let argv_rest: Vec<String> = std::env::args().skip(1).collect();

    let conf_dirs: Vec<PathBuf> = std::env::var("__cdist_conf_dirs")
        .unwrap_or_default()
        .split(':')
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    let work_dir = PathBuf::from(std::env::var("__cdist_work_dir").unwrap_or_default());
    let object_marker = std::env::var("__cdist_object_marker").unwrap_or_else(|_| ".cdist".to_string());
    let parent_object = std::env::var("__object_name").ok();

    let registry = TypeRegistry::discover(&conf_dirs)?;
    let ty = registry.get(type_name).map_err(EmulatorError::from)?;

    let stdin_bytes = if should_capture_stdin() {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).ok();
        Some(buf)
    } else {
        None
    };

    let env = EmulatorEnv {
        require: std::env::var("require").ok(),
        cdist_order_dependency: std::env::var("CDIST_ORDER_DEPENDENCY").is_ok(),
        cdist_override: std::env::var("CDIST_OVERRIDE").is_ok(),
        order_dep_file: std::env::var("__cdist_manifest").ok().map(PathBuf::from),
        parent_object: parent_object.clone(),
    };

    let invocation = EmulatorInvocation::parse(type_name, &argv_rest, ty, &env, stdin_bytes, &object_marker)?;

    let mut store = ObjectStore::open(work_dir.clone(), object_marker.clone()).map_err(EmulatorError::from)?;
    let object = store
        .declare(
            ty,
            &invocation.object_id,
            invocation.parameters.clone(),
            invocation.requires.clone(),
            parent_object.clone().unwrap_or_else(|| "__cdist_initial_manifest".to_string()),
            env.cdist_override,
        )
        .map_err(EmulatorError::from)?;
    let object_name = object.name.clone();

    if let Some(stdin) = invocation.stdin {
        store.set_stdin(&object_name, stdin);
    }
    store.sync_to_disk(&object_name).map_err(EmulatorError::from)?;

    // Record the order-dependency predecessor for the *next* call in this
    // manifest process (spec §4.3 step 8), independent of the edge already
    // folded into `requires` above.
    if let Some(path) = &env.order_dep_file {
        std::fs::write(path, &object_name).ok();
    }

    if let Some(parent) = &invocation.parent_object {
        store.append_autorequire_on_disk(parent, &object_name).map_err(EmulatorError::from)?;
    }

    Ok(())
}

/// Map a run's outcome onto the exit code convention from spec §4.10: 0 on
/// success, 2 on interrupt, non-zero (via the propagated `anyhow::Error`)
/// otherwise.
fn finish_run(result: Result<usize, Error>, verb: &str) -> anyhow::Result<()> {
    match result {
        Ok(iterations) => {
            tracing::info!(iterations, "{verb} complete");
            Ok(())
        }
        Err(Error::Configurator(ConfiguratorError::Interrupted)) => {
            tracing::warn!("interrupted");
            std::process::exit(2);
        }
        Err(e) => Err(anyhow::Error::from(e)),
    }
}

fn check_settings(path: &PathBuf) -> anyhow::Result<()> {
    let settings = Settings::load(path)?;
    println!("settings OK: {} conf dir(s), jobs={}", settings.conf_dirs.len(), settings.jobs);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv0 = std::env::args().next().unwrap_or_default();
    if let Some(type_name) = argv0_type_name(&argv0) {
        init_logging();
        return run_as_emulator(type_name);
    }

    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { host, settings, manifest, check } => {
            if check {
                return check_settings(&settings);
            }
            let mut loaded = Settings::load(&settings)?;
            loaded.install_mode = false;
            let manifest_path = manifest.unwrap_or_else(|| loaded.conf_dirs.first().map(|d| d.join("manifest/init")).unwrap_or_default());
            let result = skonfig::run_for_host(host, std::sync::Arc::new(loaded), manifest_path).await;
            finish_run(result, "run")
        }
        Commands::Install { host, settings, manifest } => {
            let mut loaded = Settings::load(&settings)?;
            loaded.install_mode = true;
            let manifest_path = manifest.unwrap_or_else(|| loaded.conf_dirs.first().map(|d| d.join("manifest/init")).unwrap_or_default());
            let result = skonfig::run_for_host(host, std::sync::Arc::new(loaded), manifest_path).await;
            finish_run(result, "install")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_dispatch_detects_dunder_argv0() {
        assert_eq!(argv0_type_name("/var/lib/skonfig/bin/__planet"), Some("__planet"));
        assert_eq!(argv0_type_name("/usr/bin/skonfig"), None);
    }
}
