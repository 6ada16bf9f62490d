//! Process handle registry.
//!
//! Every process the runtime spawns (shell commands, background services,
//! assistant CLI turns) is registered here under a caller-chosen token, so any
//! in-flight unit can be cancelled by token without knowing which component
//! started it.
//!
//! Tokens are reserved *before* the process is spawned. A cancel that arrives
//! between reservation and spawn is remembered by the [`ProcessGroup`] and the
//! spawn is skipped.

pub mod service;
pub mod shell;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;

pub use service::{ServiceError, ServiceLine, ServiceRunner, ServiceStatus};
pub use shell::{ExecError, ShellExecutor, ShellOutput};

/// Exit code reported for a shell command cancelled through the registry.
pub const KILLED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Token '{0}' is already bound to a running process")]
    AlreadyRegistered(String),
}

/// Which component owns a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Shell,
    Service,
    Assistant,
}

/// A unit of work that can be asked to stop.
///
/// `cancel` must be cheap, non-blocking and idempotent; it only *requests*
/// termination. The owner of the unit observes the actual exit.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Cancellation handle for a child spawned as the leader of its own process
/// group.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    token: CancellationToken,
    pid: Mutex<Option<u32>>,
}

impl ProcessGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the pid of the spawned group leader.
    ///
    /// If a cancel already arrived, the group is signalled right away.
    pub fn attach(&self, pid: Option<u32>) {
        *lock(&self.pid) = pid;
        if self.token.is_cancelled() {
            if let Some(pid) = pid {
                signal_group(pid, Signal::Terminate);
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Forcefully kill whatever is left of the group.
    pub fn kill(&self) {
        if let Some(pid) = self.pid() {
            signal_group(pid, Signal::Kill);
        }
    }
}

impl Cancellable for ProcessGroup {
    fn cancel(&self) {
        self.token.cancel();
        if let Some(pid) = self.pid() {
            signal_group(pid, Signal::Terminate);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Signal {
    Terminate,
    Kill,
}

/// Send a signal to every process in the group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions. A stale pgid yields ESRCH.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if rc != 0 {
        tracing::debug!(pid, ?signal, "killpg failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    tracing::debug!(pid, ?signal, "Process groups are not supported on this platform");
}

/// Put the child in a fresh process group so the whole tree can be signalled.
pub(crate) fn isolate_process_group(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Read one line from `reader`, without its `\n` or `\r\n` terminator.
///
/// Invalid UTF-8 is replaced rather than treated as an error, so a stray byte
/// never stops a reader while the child keeps writing. Returns `None` at EOF.
/// Bytes of a partially read line stay in `buf` if the future is dropped.
pub(crate) async fn read_line_lossy<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    reader.read_until(b'\n', buf).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
        if buf[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    Ok(Some(line))
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub token: String,
    pub kind: ProcessKind,
    pub registered_at: DateTime<Utc>,
}

struct Entry {
    id: u64,
    kind: ProcessKind,
    unit: Arc<dyn Cancellable>,
    registered_at: DateTime<Utc>,
}

/// Token → process map shared by all executors.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `token` to `unit`.
    ///
    /// The binding is released when the returned [`Registration`] is dropped.
    pub fn register(
        &self,
        token: &str,
        kind: ProcessKind,
        unit: Arc<dyn Cancellable>,
    ) -> Result<Registration, RegistryError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(token) {
            return Err(RegistryError::AlreadyRegistered(token.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            token.to_string(),
            Entry {
                id,
                kind,
                unit,
                registered_at: Utc::now(),
            },
        );
        tracing::debug!(token = %token, ?kind, "Registered process token");
        Ok(Registration {
            registry: self.clone(),
            token: token.to_string(),
            id,
        })
    }

    /// Ask the process bound to `token` to terminate.
    ///
    /// Unknown or already finished tokens are a no-op; returns whether a
    /// process was signalled.
    pub fn signal(&self, token: &str) -> bool {
        let unit = lock(&self.entries).get(token).map(|e| Arc::clone(&e.unit));
        match unit {
            Some(unit) => {
                tracing::info!(token = %token, "Signalling process");
                unit.cancel();
                true
            }
            None => {
                tracing::debug!(token = %token, "Signal for unknown token ignored");
                false
            }
        }
    }

    /// Signal every registered process. Used on shutdown.
    pub fn signal_all(&self) -> usize {
        let units: Vec<_> = lock(&self.entries)
            .values()
            .map(|e| Arc::clone(&e.unit))
            .collect();
        for unit in &units {
            unit.cancel();
        }
        units.len()
    }

    /// Drop the binding for `token`, whoever owns it.
    pub fn unregister(&self, token: &str) -> bool {
        lock(&self.entries).remove(token).is_some()
    }

    fn release(&self, token: &str, id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(token).is_some_and(|e| e.id == id) {
            entries.remove(token);
            tracing::debug!(token = %token, "Released process token");
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        lock(&self.entries).contains_key(token)
    }

    /// Currently bound tokens, sorted.
    pub fn list_running(&self) -> Vec<String> {
        let mut tokens: Vec<_> = lock(&self.entries).keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Currently bound tokens of one kind, sorted.
    pub fn list_running_kind(&self, kind: ProcessKind) -> Vec<String> {
        let mut tokens: Vec<_> = lock(&self.entries)
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<_> = lock(&self.entries)
            .iter()
            .map(|(token, e)| ProcessInfo {
                token: token.clone(),
                kind: e.kind,
                registered_at: e.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.token.cmp(&b.token));
        infos
    }
}

/// Keeps a token bound for as long as it lives.
///
/// Dropping it releases the binding, unless the token has since been
/// re-registered by someone else.
pub struct Registration {
    registry: ProcessRegistry,
    token: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.token, self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
