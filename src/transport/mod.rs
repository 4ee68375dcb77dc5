//! The transport abstraction (spec §4.1).
//!
//! Exposes two peers with a near-identical surface — [`local::LocalTransport`]
//! and [`remote::RemoteTransport`] — behind the [`Transport`] trait, the way
//! the local/SSH sandbox split worked in the test-runner this engine grew
//! out of: one trait, two execution backends, same call surface for callers.

pub mod local;
pub mod remote;

use std::path::Path;

use async_trait::async_trait;

use crate::error::TransportError;

pub type TransportResult<T> = Result<T, TransportError>;

/// A command to run through a transport peer.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Render as a single shell-quoted argv line (spec §4.1: "`argv` is a
    /// list-of-strings, joined using the shell-quoter").
    pub fn argv_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        crate::quoting::join(&parts)
    }
}

/// Result of executing a command, with optional captured output.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The two transport peers (local, remote) share this surface (spec §4.1).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `argv` with `env` set, optionally capturing output.
    async fn run(
        &self,
        cmd: &Command,
        return_output: bool,
    ) -> TransportResult<ExecResult>;

    /// Run a script file: directly if executable, else via the configured
    /// shell with `-e` (spec §4.1).
    async fn run_script(
        &self,
        path: &Path,
        env: &[(String, String)],
        return_output: bool,
    ) -> TransportResult<ExecResult>;

    async fn mkdir(&self, path: &str) -> TransportResult<()>;
    async fn rmdir(&self, path: &str) -> TransportResult<()>;
    async fn rmfile(&self, path: &str) -> TransportResult<()>;

    /// Copy `src` to `dst`. The remote peer applies the archiving policy
    /// from spec §4.1; the local peer always copies directly.
    async fn transfer(&self, src: &Path, dst: &str) -> TransportResult<()>;

    /// Fetch `src` on the peer down to local path `dst` (used by the driver
    /// to pull explorer output back; a no-op distinction for the local
    /// peer, since "remote" and "local" coincide).
    async fn fetch(&self, src: &str, dst: &Path) -> TransportResult<()>;

    /// Best-effort shutdown hook (e.g. SSH control-master `-O exit`);
    /// failures are logged and swallowed per spec §7's propagation policy.
    async fn cleanup(&self);
}
