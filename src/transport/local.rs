//! Local transport peer (spec §4.1).
//!
//! Runs commands as direct child processes of the engine and copies files
//! with `tokio::fs`. Grounded on the local-process execution pattern this
//! engine's predecessor used for its "run as a local process" backend:
//! spawn through `tokio::process::Command`, pipe stdout/stderr, decode to a
//! `Vec<u8>`/`String` on completion.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

use crate::error::TransportError;
use crate::transport::{Command, ExecResult, Transport, TransportResult};

pub struct LocalTransport {
    pub shell: String,
}

impl LocalTransport {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }

    async fn spawn(&self, program: &str, args: &[String], env: &[(String, String)]) -> TransportResult<ExecResult> {
        let mut command = TokioCommand::new(program);
        command.args(args);
        for (k, v) in env {
            command.env(k, v);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            argv: format!("{program} {}", args.join(" ")),
            source,
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout).await?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr).await?;
        }
        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code != 0 {
            return Err(TransportError::NonZeroExit {
                argv: format!("{program} {}", args.join(" ")),
                exit_code,
            });
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn copy_dir_all<'a>(src: &'a Path, dst: &'a Path) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_all(&entry.path(), &dst_path).await?;
            } else {
                tokio::fs::copy(entry.path(), dst_path).await?;
            }
        }
        Ok(())
    })
}

#[async_trait]
impl Transport for LocalTransport {
    async fn run(&self, cmd: &Command, _return_output: bool) -> TransportResult<ExecResult> {
        self.spawn(&cmd.program, &cmd.args, &cmd.env).await
    }

    async fn run_script(
        &self,
        path: &Path,
        env: &[(String, String)],
        _return_output: bool,
    ) -> TransportResult<ExecResult> {
        let is_executable = tokio::fs::metadata(path)
            .await
            .map(|m| {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    m.permissions().mode() & 0o111 != 0
                }
                #[cfg(not(unix))]
                {
                    let _ = m;
                    false
                }
            })
            .unwrap_or(false);

        if is_executable {
            self.spawn(&path.to_string_lossy(), &[], env).await
        } else {
            self.spawn(&self.shell, &["-e".to_string(), path.to_string_lossy().into_owned()], env)
                .await
        }
    }

    async fn mkdir(&self, path: &str) -> TransportResult<()> {
        tokio::fs::create_dir_all(path).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e.into())
            }
        })
    }

    async fn rmdir(&self, path: &str) -> TransportResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rmfile(&self, path: &str) -> TransportResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn transfer(&self, src: &Path, dst: &str) -> TransportResult<()> {
        let dst_path = PathBuf::from(dst);
        let meta = tokio::fs::metadata(src).await?;
        if meta.is_dir() {
            copy_dir_all(src, &dst_path).await?;
        } else {
            if let Some(parent) = dst_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(src, &dst_path).await?;
        }
        Ok(())
    }

    async fn fetch(&self, src: &str, dst: &Path) -> TransportResult<()> {
        self.transfer(Path::new(src), &dst.to_string_lossy()).await
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn run_captures_stdout() {
        let transport = LocalTransport::new("/bin/sh");
        let cmd = Command::new("echo").arg("hello");
        let result = transport.run(&cmd, true).await.unwrap();
        assert!(result.success());
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let transport = LocalTransport::new("/bin/sh");
        let cmd = Command::new("false");
        let err = transport.run(&cmd, false).await.unwrap_err();
        assert!(matches!(err, TransportError::NonZeroExit { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn transfer_copies_directory_recursively() {
        let transport = LocalTransport::new("/bin/sh");
        let src = tempdir().unwrap();
        tokio::fs::create_dir(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("sub/a"), b"x").await.unwrap();

        let dst = tempdir().unwrap();
        let dst_path = dst.path().join("copy");
        transport.transfer(src.path(), &dst_path.to_string_lossy()).await.unwrap();

        assert_eq!(tokio::fs::read(dst_path.join("sub/a")).await.unwrap(), b"x");
    }
}
