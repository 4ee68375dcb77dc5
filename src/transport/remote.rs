//! Remote (SSH) transport peer (spec §4.1).
//!
//! Commands are wrapped as
//! `<remote-exec> <host> exec /bin/sh -c '<exported env>; <user command>'`
//! because an arbitrary user shell on the target may not be POSIX. Grounded
//! on this engine's SSH-backed execution peer: build the option string once,
//! shell out through `tokio::process::Command`, decode captured output.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;

use crate::archive;
use crate::error::TransportError;
use crate::quoting;
use crate::transport::{Command, ExecResult, Transport, TransportResult};

pub struct RemoteTransport {
    pub host: String,
    /// `ssh`-shaped command, e.g. `"ssh -o User=root"` (spec §4.1 default).
    pub remote_exec: String,
    /// `scp`-shaped command for file transfer.
    pub remote_copy: String,
    pub remote_shell: String,
    pub archiving_enabled: bool,
}

impl RemoteTransport {
    pub fn new(host: impl Into<String>, remote_exec: String, remote_copy: String, remote_shell: String, archiving_enabled: bool) -> Self {
        Self {
            host: host.into(),
            remote_exec,
            remote_copy,
            remote_shell,
            archiving_enabled,
        }
    }

    fn bracketed_host(&self) -> String {
        quoting::bracket_host(&self.host)
    }

    fn remote_exec_parts(&self) -> Vec<String> {
        shell_words::split(&self.remote_exec).expect("remote_exec must be valid shell words")
    }

    fn remote_copy_parts(&self) -> Vec<String> {
        shell_words::split(&self.remote_copy).expect("remote_copy must be valid shell words")
    }

    /// Build the wrapped `/bin/sh -c '<exported env>; <user command>'`
    /// string described in spec §4.1.
    fn wrap(&self, argv_line: &str, env: &[(String, String)]) -> String {
        let exports: String = env
            .iter()
            .map(|(k, v)| quoting::export(k, v))
            .collect::<Vec<_>>()
            .join(" ");
        let body = if exports.is_empty() {
            argv_line.to_string()
        } else {
            format!("export {exports}; {argv_line}")
        };
        format!("{} -c {}", self.remote_shell, quoting::quote(&body))
    }

    async fn exec_wrapped(&self, argv_line: &str, env: &[(String, String)]) -> TransportResult<ExecResult> {
        let wrapped = self.wrap(argv_line, env);

        let mut parts = self.remote_exec_parts();
        parts.push(self.bracketed_host());
        parts.push("exec".to_string());
        parts.push(wrapped);

        let (program, args) = parts.split_first().expect("remote_exec is non-empty");
        let mut command = TokioCommand::new(program);
        command.args(args);
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let output = command.output().await.map_err(|source| TransportError::Spawn {
            argv: parts.join(" "),
            source,
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Err(TransportError::NonZeroExit {
                argv: argv_line.to_string(),
                exit_code,
            });
        }

        Ok(ExecResult {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn remote_dest(&self, path: &str) -> String {
        format!("{}:{}", self.bracketed_host(), path)
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn run(&self, cmd: &Command, _return_output: bool) -> TransportResult<ExecResult> {
        self.exec_wrapped(&cmd.argv_line(), &cmd.env).await
    }

    async fn run_script(
        &self,
        path: &Path,
        env: &[(String, String)],
        _return_output: bool,
    ) -> TransportResult<ExecResult> {
        // The script has already been transferred to this path on the
        // remote by the caller (explorer/code subsystems); we don't know
        // its executable bit from here, so run it via the configured shell
        // with `-e`, matching spec §4.1's fallback branch.
        let line = quoting::join(&[self.remote_shell.clone(), "-e".to_string(), path.to_string_lossy().into_owned()]);
        self.exec_wrapped(&line, env).await
    }

    async fn mkdir(&self, path: &str) -> TransportResult<()> {
        let line = quoting::join(&["mkdir".to_string(), "-p".to_string(), path.to_string()]);
        self.exec_wrapped(&line, &[]).await.map(|_| ())
    }

    async fn rmdir(&self, path: &str) -> TransportResult<()> {
        let line = quoting::join(&["rm".to_string(), "-rf".to_string(), path.to_string()]);
        self.exec_wrapped(&line, &[]).await.map(|_| ())
    }

    async fn rmfile(&self, path: &str) -> TransportResult<()> {
        let line = quoting::join(&["rm".to_string(), "-f".to_string(), path.to_string()]);
        self.exec_wrapped(&line, &[]).await.map(|_| ())
    }

    async fn transfer(&self, src: &Path, dst: &str) -> TransportResult<()> {
        let meta = std::fs::metadata(src)?;
        if meta.is_dir() && archive::should_archive(src, self.archiving_enabled).map_err(TransportError::Io)? {
            let staging = tempfile::tempdir().map_err(TransportError::Io)?;
            let archive_path = staging.path().join("payload.tar.gz");
            archive::create_tar_gz(src, &archive_path).map_err(TransportError::Io)?;

            let remote_archive = format!("{dst}.tar.gz");
            self.copy_one(&archive_path, &remote_archive).await?;

            let line = format!(
                "mkdir -p {d} && tar -xzf {a} -C {d} && rm -f {a}",
                d = quoting::quote(dst),
                a = quoting::quote(&remote_archive),
            );
            self.exec_wrapped(&line, &[]).await?;
        } else if meta.is_dir() {
            // Files-limit not exceeded (or archiving disabled): copy entries
            // one by one (spec §4.1: "Otherwise send files one-by-one").
            self.mkdir(dst).await?;
            for entry in std::fs::read_dir(src)? {
                let entry = entry?;
                let dest_entry = format!("{dst}/{}", entry.file_name().to_string_lossy());
                self.copy_one(&entry.path(), &dest_entry).await?;
            }
        } else {
            self.copy_one(src, dst).await?;
        }
        Ok(())
    }

    async fn fetch(&self, src: &str, dst: &Path) -> TransportResult<()> {
        let mut parts = self.remote_copy_parts();
        parts.push(self.remote_dest(src));
        parts.push(dst.to_string_lossy().into_owned());
        let (program, args) = parts.split_first().expect("remote_copy is non-empty");
        let status = TokioCommand::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| TransportError::Spawn { argv: parts.join(" "), source })?;
        if !status.success() {
            return Err(TransportError::Transfer {
                src: src.to_string(),
                dst: dst.to_string_lossy().into_owned(),
                reason: format!("scp exited with {status}"),
            });
        }
        Ok(())
    }

    async fn cleanup(&self) {
        // SSH multiplexing cleanup (`-O exit`) plugs in here when a
        // multiplex probe collaborator is configured; absent one, there is
        // no persistent control connection to tear down.
    }
}

impl RemoteTransport {
    async fn copy_one(&self, local: &Path, remote_path: &str) -> TransportResult<()> {
        let mut parts = self.remote_copy_parts();
        parts.push(local.to_string_lossy().into_owned());
        parts.push(self.remote_dest(remote_path));
        let (program, args) = parts.split_first().expect("remote_copy is non-empty");
        let status = TokioCommand::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| TransportError::Spawn { argv: parts.join(" "), source })?;
        if !status.success() {
            return Err(TransportError::Transfer {
                src: local.to_string_lossy().into_owned(),
                dst: remote_path.to_string(),
                reason: format!("copy exited with {status}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> RemoteTransport {
        RemoteTransport::new("example.com", "ssh -o User=root".into(), "scp -o User=root".into(), "/bin/sh".into(), true)
    }

    #[test]
    fn wraps_command_with_exported_env() {
        let t = transport();
        let wrapped = t.wrap("echo hi", &[("FOO".to_string(), "bar baz".to_string())]);
        assert!(wrapped.contains("export FOO='bar baz'; echo hi"));
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let mut t = transport();
        t.host = "::1".to_string();
        assert_eq!(t.bracketed_host(), "[::1]");
    }

    #[test]
    fn remote_dest_uses_bracketed_host() {
        let mut t = transport();
        t.host = "::1".to_string();
        assert_eq!(t.remote_dest("/tmp/x"), "[::1]:/tmp/x");
    }
}
