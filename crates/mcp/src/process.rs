//! Tool server process supervision (spawn, stderr drain, terminate).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Configuration for a tool server process.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Label used in logs.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory; inherits ours when `None`.
    pub cwd: Option<PathBuf>,
    /// How long a caller waits for a response. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A running tool server child process.
#[derive(Debug)]
pub struct ServerProcess {
    name: String,
    child: Child,
}

impl ServerProcess {
    /// Launch the process with piped stdio.
    ///
    /// Returns the handle together with the child's stdin (outbound) and
    /// stdout (inbound). Stderr is forwarded to the log.
    pub fn spawn(config: &ServerConfig) -> Result<(Self, ChildStdin, ChildStdout)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(Error::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                }
            });
        }

        info!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            pid = ?child.id(),
            "tool server started"
        );

        Ok((
            Self {
                name: config.name.clone(),
                child,
            },
            stdin,
            stdout,
        ))
    }

    /// OS process id, if the process has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send a termination signal and wait for exit.
    ///
    /// Idempotent: returns immediately if the process already exited.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            debug!(server = %self.name, %status, "tool server already exited");
            return Ok(());
        }

        self.terminate()?;
        let status = self.child.wait().await?;
        info!(server = %self.name, %status, "tool server stopped");
        Ok(())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return Ok(self.child.start_kill()?);
        };
        // SAFETY: plain syscall on a pid we own; no memory is shared.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            warn!(server = %self.name, "SIGTERM failed: {err}");
            return Err(err.into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        Ok(self.child.start_kill()?)
    }
}
