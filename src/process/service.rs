//! Long-running background services (dev servers, watchers).
//!
//! Each service runs in its own process group under its service id. Output
//! is streamed line by line onto the [`EventBus`] and the most recent lines
//! are kept in a bounded buffer while the service is alive. Every start ends
//! with exactly one completion event, emitted after all output lines.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::shell::{exit_code_of, shell_command};
use super::{
    isolate_process_group, lock, read_line_lossy, Cancellable, ProcessGroup, ProcessKind,
    ProcessRegistry, Registration,
};
use crate::events::{EventBus, ProcessOutput};
use crate::util::resolve_working_dir;

/// How long output readers may outlive the group leader before being dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Working directory does not exist: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Failed to start service: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A buffered output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceLine {
    pub text: String,
    pub is_stderr: bool,
    pub at: DateTime<Utc>,
}

/// Run state of a started service. Exists only while the process is alive.
struct ServiceRun {
    command: String,
    started_at: DateTime<Utc>,
    lines: Mutex<VecDeque<ServiceLine>>,
    max_lines: usize,
}

impl ServiceRun {
    fn push(&self, text: String, is_stderr: bool) {
        let mut lines = lock(&self.lines);
        lines.push_back(ServiceLine {
            text,
            is_stderr,
            at: Utc::now(),
        });
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }
}

/// Summary of a running service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
}

#[derive(Clone)]
pub struct ServiceRunner {
    registry: ProcessRegistry,
    events: EventBus,
    runs: Arc<Mutex<HashMap<String, (Arc<ServiceRun>, Arc<ProcessGroup>)>>>,
    max_lines: usize,
}

impl ServiceRunner {
    pub fn new(registry: ProcessRegistry, events: EventBus, max_lines: usize) -> Self {
        Self {
            registry,
            events,
            runs: Arc::new(Mutex::new(HashMap::new())),
            max_lines: max_lines.max(1),
        }
    }

    /// Start `command` as service `id`.
    ///
    /// Returns once the process is spawned; output and the final completion
    /// arrive on the event bus.
    pub async fn start(
        &self,
        id: &str,
        command: &str,
        working_dir: Option<&str>,
    ) -> Result<(), ServiceError> {
        let cwd = resolve_working_dir(working_dir).map_err(ServiceError::InvalidDirectory)?;

        let group = ProcessGroup::new();
        let registration = self
            .registry
            .register(id, ProcessKind::Service, group.clone())
            .map_err(|_| ServiceError::AlreadyRunning(id.to_string()))?;

        let mut cmd = shell_command(command);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(service_id = %id, "Failed to start service: {}", e);
            ServiceError::Spawn(e)
        })?;
        group.attach(child.id());

        tracing::info!(service_id = %id, pid = ?child.id(), cwd = ?cwd, "Service started: {}", command);

        let run = Arc::new(ServiceRun {
            command: command.to_string(),
            started_at: Utc::now(),
            lines: Mutex::new(VecDeque::new()),
            max_lines: self.max_lines,
        });
        lock(&self.runs).insert(id.to_string(), (Arc::clone(&run), Arc::clone(&group)));

        let stdout_task = self.spawn_pump(id, &run, child.stdout.take(), false);
        let stderr_task = self.spawn_pump(id, &run, child.stderr.take(), true);

        let runner = self.clone();
        let service_id = id.to_string();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => Some(exit_code_of(status)),
                Err(e) => {
                    tracing::error!(service_id = %service_id, "Failed to wait for service: {}", e);
                    None
                }
            };
            if group.is_cancelled() {
                group.kill();
            }
            runner
                .finish(&service_id, &run, registration, exit_code, [stdout_task, stderr_task])
                .await;
        });

        Ok(())
    }

    fn spawn_pump<R>(
        &self,
        id: &str,
        run: &Arc<ServiceRun>,
        reader: Option<R>,
        is_stderr: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let run = Arc::clone(run);
        let id = id.to_string();
        tokio::spawn(async move {
            let Some(reader) = reader else {
                return;
            };
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                match read_line_lossy(&mut reader, &mut buf).await {
                    Ok(Some(line)) => {
                        run.push(line.clone(), is_stderr);
                        events.process_output(ProcessOutput::line(&id, line, is_stderr));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(service_id = %id, is_stderr, "Service output ended: {}", e);
                        break;
                    }
                }
            }
        })
    }

    async fn finish(
        &self,
        id: &str,
        run: &Arc<ServiceRun>,
        registration: Registration,
        exit_code: Option<i32>,
        pumps: [JoinHandle<()>; 2],
    ) {
        for mut pump in pumps {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
                tracing::warn!(service_id = %id, "Service output still open after exit, dropping reader");
                pump.abort();
            }
        }

        {
            let mut runs = lock(&self.runs);
            if runs.get(id).is_some_and(|(r, _)| Arc::ptr_eq(r, run)) {
                runs.remove(id);
            }
        }
        // Release the id before announcing completion so a restart can follow immediately.
        drop(registration);

        tracing::info!(service_id = %id, exit_code = ?exit_code, "Service exited");
        self.events
            .process_output(ProcessOutput::complete(id, exit_code));
    }

    /// Ask service `id` to stop. The completion event follows once the process
    /// has actually exited. Returns `false` if it was not running.
    pub fn stop(&self, id: &str) -> bool {
        let group = lock(&self.runs).get(id).map(|(_, g)| Arc::clone(g));
        match group {
            Some(group) => {
                tracing::info!(service_id = %id, "Stopping service");
                group.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.runs).contains_key(id)
    }

    /// Ids of services whose process is alive, sorted.
    pub fn list_running(&self) -> Vec<String> {
        self.registry.list_running_kind(ProcessKind::Service)
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        let mut out: Vec<_> = lock(&self.runs)
            .iter()
            .map(|(id, (run, group))| ServiceStatus {
                id: id.clone(),
                command: run.command.clone(),
                started_at: run.started_at,
                pid: group.pid(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Buffered output of a running service, oldest first.
    pub fn recent_output(&self, id: &str) -> Option<Vec<ServiceLine>> {
        let run = lock(&self.runs).get(id).map(|(r, _)| Arc::clone(r))?;
        let lines = lock(&run.lines).iter().cloned().collect();
        Some(lines)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn runner(max_lines: usize) -> ServiceRunner {
        ServiceRunner::new(ProcessRegistry::new(), EventBus::default(), max_lines)
    }

    async fn collect_run(
        stream: impl futures::Stream<Item = ProcessOutput>,
    ) -> Vec<ProcessOutput> {
        tokio::time::timeout(Duration::from_secs(15), stream.collect::<Vec<_>>())
            .await
            .expect("service run should complete")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn streams_lines_then_single_completion() {
        let runner = runner(200);
        let stream = runner.events.subscribe_source("web");
        runner
            .start("web", "echo one; echo two 1>&2; echo three", Some("/tmp"))
            .await
            .unwrap();

        let events = collect_run(stream).await;
        let completions: Vec<_> = events.iter().filter(|e| e.is_complete).collect();
        assert_eq!(completions.len(), 1);
        let last = events.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.exit_code, Some(0));
        assert!(last.text.is_none());

        let stdout: Vec<_> = events
            .iter()
            .filter(|e| !e.is_complete && !e.is_stderr)
            .filter_map(|e| e.text.clone())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(events
            .iter()
            .any(|e| e.is_stderr && e.text.as_deref() == Some("two")));

        assert!(!runner.is_running("web"));
        assert!(runner.list_running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_utf8_does_not_end_the_stream() {
        let runner = runner(200);
        let stream = runner.events.subscribe_source("bytes");
        runner
            .start("bytes", "printf 'ok\\n\\377\\n'; sleep 0.5; echo after", None)
            .await
            .unwrap();

        let events = collect_run(stream).await;
        let lines: Vec<_> = events.iter().filter_map(|e| e.text.clone()).collect();
        assert_eq!(lines, vec!["ok", "\u{FFFD}", "after"]);
        let last = events.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.exit_code, Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn second_start_is_rejected_until_stopped() {
        let runner = runner(200);
        let stream = runner.events.subscribe_source("dev");
        runner.start("dev", "sleep 30", None).await.unwrap();
        assert_eq!(runner.list_running(), vec!["dev"]);

        let err = runner.start("dev", "sleep 30", None).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRunning(id) if id == "dev"));

        assert!(runner.stop("dev"));
        let events = collect_run(stream).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_complete);
        assert_eq!(events[0].exit_code, Some(128 + libc::SIGTERM));

        let stream = runner.events.subscribe_source("dev");
        runner.start("dev", "echo back", None).await.unwrap();
        let events = collect_run(stream).await;
        assert_eq!(events[0].text.as_deref(), Some("back"));
        assert!(events.last().unwrap().is_complete);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn buffer_keeps_most_recent_lines() {
        let runner = runner(200);
        runner
            .start("log", "seq 1 500; sleep 30", None)
            .await
            .unwrap();

        let mut lines = Vec::new();
        for _ in 0..500 {
            lines = runner.recent_output("log").unwrap_or_default();
            if lines.last().map(|l| l.text.as_str()) == Some("500") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0].text, "301");
        assert_eq!(lines[199].text, "500");

        let stream = runner.events.subscribe_source("log");
        runner.stop("log");
        collect_run(stream).await;
        assert!(runner.recent_output("log").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_unknown_service_returns_false() {
        let runner = runner(10);
        assert!(!runner.stop("ghost"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn registry_signal_stops_service() {
        let registry = ProcessRegistry::new();
        let runner = ServiceRunner::new(registry.clone(), EventBus::default(), 10);
        let stream = runner.events.subscribe_source("watch");
        runner.start("watch", "sleep 30", None).await.unwrap();
        assert_eq!(runner.status()[0].id, "watch");

        assert!(registry.signal("watch"));
        let events = collect_run(stream).await;
        assert!(events.last().unwrap().is_complete);
        assert!(!registry.contains("watch"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invalid_directory_is_rejected() {
        let runner = runner(10);
        let err = runner
            .start("bad", "echo hi", Some("/no/such/quest/dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidDirectory(_)));
        assert!(runner.list_running().is_empty());
    }
}
