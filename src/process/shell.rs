//! One-shot shell command execution.
//!
//! Commands run through `/bin/sh -c` in their own process group. Output is
//! captured raw (ANSI sequences included); stripping control codes is left to
//! whoever displays it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{
    isolate_process_group, ProcessGroup, ProcessKind, ProcessRegistry, RegistryError,
    KILLED_EXIT_CODE,
};
use crate::util::resolve_working_dir;

/// How long a cancelled command gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    AlreadyRegistered(#[from] RegistryError),

    #[error("Working directory does not exist: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for command: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a command that ran.
///
/// A non-zero `exit_code` is a completed run with a failure result, not an
/// executor error. `exit_code` is [`KILLED_EXIT_CODE`] for a cancelled run,
/// but a command may exit with the same code on its own; `cancelled` tells
/// the two apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub cancelled: bool,
}

impl ShellOutput {
    fn cancelled() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: KILLED_EXIT_CODE,
            cancelled: true,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Build the platform shell invocation for `command`.
pub(crate) fn shell_command(command: &str) -> Command {
    let (shell, shell_arg) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("/bin/sh", "-c")
    };
    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg).arg(command);
    cmd
}

/// Map an exit status to a single integer.
///
/// Signal deaths follow the shell convention of `128 + signal`.
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

fn spawn_capture<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            // A read error ends capture; keep what arrived before it.
            if let Err(e) = reader.read_to_end(&mut buf).await {
                tracing::debug!("Output capture ended early: {}", e);
            }
        }
        buf
    })
}

/// Kills the process group unless disarmed, so an abandoned run does not
/// leave shell-spawned children behind.
struct GroupReaper {
    group: Arc<ProcessGroup>,
    armed: bool,
}

impl GroupReaper {
    fn new(group: Arc<ProcessGroup>) -> Self {
        Self { group, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for GroupReaper {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(pid = ?self.group.pid(), "Command abandoned, killing group");
            self.group.kill();
        }
    }
}

#[derive(Clone)]
pub struct ShellExecutor {
    registry: ProcessRegistry,
}

impl ShellExecutor {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }

    /// Run `command` to completion or cancellation.
    ///
    /// `token` is bound in the registry for the duration of the run; signalling
    /// it kills the whole process group and this call resolves with the output
    /// captured so far and [`KILLED_EXIT_CODE`].
    pub async fn run(
        &self,
        token: &str,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<ShellOutput, ExecError> {
        let cwd = resolve_working_dir(working_dir).map_err(ExecError::InvalidDirectory)?;

        let group = ProcessGroup::new();
        let _registration = self
            .registry
            .register(token, ProcessKind::Shell, group.clone())?;

        if group.is_cancelled() {
            tracing::info!(token = %token, "Command cancelled before spawn");
            return Ok(ShellOutput::cancelled());
        }

        let mut cmd = shell_command(command);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);

        tracing::info!(token = %token, cwd = ?cwd, "Executing command: {}", command);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(token = %token, "Command spawn failed: {}", e);
            ExecError::Spawn(e)
        })?;
        group.attach(child.id());
        let reaper = GroupReaper::new(Arc::clone(&group));

        let stdout_task = spawn_capture(child.stdout.take());
        let stderr_task = spawn_capture(child.stderr.take());

        let (status, cancelled) = tokio::select! {
            status = child.wait() => (status?, false),
            _ = group.cancelled() => {
                let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!(token = %token, "Command ignored SIGTERM, killing group");
                        group.kill();
                        child.wait().await?
                    }
                };
                // Reap stragglers that might still hold the pipes open.
                group.kill();
                (status, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        reaper.disarm();

        let exit_code = if cancelled {
            KILLED_EXIT_CODE
        } else {
            exit_code_of(status)
        };

        tracing::debug!(
            token = %token,
            exit_code,
            cancelled,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command finished"
        );

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            cancelled,
        })
    }

    /// Best-effort cancellation of the command bound to `token`.
    pub fn kill(&self, token: &str) -> bool {
        self.registry.signal(token)
    }
}
