// AutoPeer: BGP peering automation toolchain written in Rust
// Copyright (C) 2022-2023 AutoPeer contributors <noc@autopeer.example.net>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Module for running commands on routers over SSH and for syncing staged
//! configuration trees with rsync.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{ExitStatus, Output},
    string::FromUtf8Error,
    time::Duration,
};

use itertools::Itertools;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

/// An SSH endpoint for one router.
///
/// No connection is held open: every call spawns a fresh `ssh` (or `rsync`)
/// process in batch mode using the deploy key. The destination must accept
/// the key without any interactive prompt, and its host key must already be
/// known — strict host key checking is always on.
#[derive(Debug, Clone)]
pub struct SshSession {
    /// `user@host` destination.
    destination: String,
    key_path: PathBuf,
    connect_timeout: u64,
}

impl SshSession {
    /// Create a new session description. Nothing is spawned yet.
    pub fn new(
        user: impl AsRef<str>,
        host: impl AsRef<str>,
        key_path: impl Into<PathBuf>,
        connect_timeout: u64,
    ) -> Self {
        Self {
            destination: format!("{}@{}", user.as_ref(), host.as_ref()),
            key_path: key_path.into(),
            connect_timeout,
        }
    }

    /// Get the destination for the session.
    pub fn name(&self) -> &str {
        &self.destination
    }

    /// Create an `ssh` command with the following attributes set:
    ///
    /// - `-i <deploy key>`
    /// - `-oConnectTimeout=<timeout>`
    /// - `-oBatchMode=yes`
    /// - `-oStrictHostKeyChecking=yes`
    /// - `kill_on_drop = true` to kill the child once it is dropped.
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .arg(format!("-oConnectTimeout={}", self.connect_timeout))
            .arg("-oBatchMode=yes")
            .arg("-oStrictHostKeyChecking=yes")
            .arg(&self.destination)
            .arg(program);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Execute a command and return the bytes of both `STDOUT` and `STDERR`.
    /// This call checks that the returned exit code is 0.
    pub async fn execute_cmd(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<(Vec<u8>, Vec<u8>), SshError> {
        let cmd_str = || args.iter().map(AsRef::as_ref).join(" ");

        log::trace!("[{}] `{}`", self.name(), cmd_str());
        let mut iter = args.iter();
        let Some(program) = iter.next() else {
            return Ok((Vec::new(), Vec::new()));
        };
        let mut cmd = self.command(program.as_ref());
        for arg in iter {
            cmd.arg(arg.as_ref());
        }
        let output = match cmd.output().await {
            Ok(out) => out,
            Err(e) => {
                log::error!("[{}] {} failed: {}", self.name(), cmd_str(), e);
                Err(e)?
            }
        };

        check_output(self.name(), output, cmd_str)
    }

    /// Execute a command and return the parsed STDOUT after checking the
    /// exit code.
    pub async fn execute_cmd_stdout(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<String, SshError> {
        let (stdout, _) = self.execute_cmd(args).await?;
        Ok(String::from_utf8(stdout)?)
    }

    /// Execute a command and return the exit status without interpreting it.
    pub async fn execute_cmd_status(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<ExitStatus, SshError> {
        log::trace!(
            "[{}] `{}`",
            self.name(),
            args.iter().map(AsRef::as_ref).join(" ")
        );
        let mut iter = args.iter();
        let Some(program) = iter.next() else {
            return Err(SshError::Client(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            )));
        };
        let mut cmd = self.command(program.as_ref());
        for arg in iter {
            cmd.arg(arg.as_ref());
        }
        match cmd.output().await {
            Ok(out) => Ok(out.status),
            Err(e) => {
                log::error!(
                    "[{}] {} failed: {}",
                    self.name(),
                    args.iter().map(AsRef::as_ref).join(" "),
                    e
                );
                Err(e)?
            }
        }
    }

    /// Sync a local directory to a remote path with rsync, removing remote
    /// files that no longer exist locally.
    pub async fn sync_directory(&self, src: &Path, dst: &str) -> Result<(), SshError> {
        let remote_shell = format!(
            "ssh -i {} -oConnectTimeout={} -oBatchMode=yes -oStrictHostKeyChecking=yes",
            self.key_path.display(),
            self.connect_timeout
        );
        let cmd_str = || {
            format!(
                "rsync -az --delete {}/ {}:{dst}/",
                src.display(),
                self.name()
            )
        };
        log::trace!("[{}] {}", self.name(), cmd_str());

        let mut cmd = Command::new("rsync");
        cmd.arg("-az")
            .arg("--delete")
            .arg("-e")
            .arg(remote_shell)
            .arg(format!("{}/", src.display()))
            .arg(format!("{}:{dst}/", self.destination));
        cmd.kill_on_drop(true);

        let output = match cmd.output().await {
            Ok(out) => out,
            Err(e) => {
                log::error!("[{}] {} failed: {}", self.name(), cmd_str(), e);
                Err(e)?
            }
        };
        check_output(self.name(), output, cmd_str).map(|_| ())
    }

    /// Reachability probe: run a remote `echo` within the given duration.
    pub async fn reachable(&self, wait: Duration) -> bool {
        matches!(
            timeout(wait, self.execute_cmd_status(&["echo", "ok"])).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

/// Check the output for a successful exit code.
pub fn check_output<F, S>(host: &str, output: Output, cmd: F) -> Result<(Vec<u8>, Vec<u8>), SshError>
where
    F: FnOnce() -> S,
    S: std::fmt::Display,
{
    if output.status.success() {
        Ok((output.stdout, output.stderr))
    } else {
        let cmd = cmd().to_string();
        log::error!(
            "[{}] {} exited with exit code {}{}{}",
            host,
            cmd,
            output.status.code().unwrap_or_default(),
            if !output.stdout.is_empty() {
                format!("\nSTDOUT:\n{}", String::from_utf8_lossy(&output.stdout))
            } else {
                String::new()
            },
            if !output.stderr.is_empty() {
                format!("\nSTDERR:\n{}", String::from_utf8_lossy(&output.stderr))
            } else {
                String::new()
            }
        );
        Err(SshError::CommandError(
            host.to_string(),
            cmd,
            output.status.code().unwrap_or_default(),
        ))
    }
}

/// Error kind returned by [`SshSession`].
#[derive(Debug, Error)]
pub enum SshError {
    /// Error while spawning or driving the child process.
    #[error("SSH client error: {0}")]
    Client(#[from] std::io::Error),
    /// Non-zero exit code of a remote command.
    #[error("Non-zero exit code of command {1} on {0}: {2}")]
    CommandError(String, String, i32),
    /// Cannot parse output as UTF-8.
    #[error("Cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    /// Timeout while waiting for the remote side.
    #[error("Timeout while waiting for {0}")]
    Timeout(String),
}
