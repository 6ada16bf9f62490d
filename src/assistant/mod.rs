//! Assistant sessions backed by the `claude` CLI.
//!
//! Each exchange spawns the CLI once in `stream-json` mode and streams its
//! progress as [`ConversationEvent`]s. Continuity between exchanges comes from
//! the CLI's own session token, which is handed back to the caller and passed
//! through unchanged on the next exchange. At most one exchange runs per
//! conversation; its conversation id is the registry token.

pub mod client;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub use client::{AssistantRequest, IntegrationConfig, IntegrationKind};

use crate::events::{ConversationEvent, EventBus};
use crate::process::{
    isolate_process_group, read_line_lossy, ProcessGroup, ProcessKind, ProcessRegistry,
};
use crate::util::{preview, resolve_working_dir};
use client::{build_args, mcp_config_path, write_mcp_config, IntegrationPlan};
use protocol::TurnAccumulator;

/// How long a cancelled CLI gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Conversation '{0}' already has an exchange in progress")]
    Busy(String),

    #[error("Working directory does not exist: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Failed to spawn assistant CLI: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write MCP config: {0}")]
    McpConfig(String),

    #[error("{0}")]
    Cli(String),

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Assistant CLI I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final result of a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantReply {
    pub response: String,
    pub session_id: Option<String>,
    pub tokens_used: Option<u64>,
}

#[derive(Clone)]
pub struct SessionManager {
    registry: ProcessRegistry,
    events: EventBus,
    cli_path: String,
}

impl SessionManager {
    pub fn new(registry: ProcessRegistry, events: EventBus, cli_path: impl Into<String>) -> Self {
        Self {
            registry,
            events,
            cli_path: cli_path.into(),
        }
    }

    /// Whether the CLI can be found on `PATH` (or at its configured path).
    pub fn is_installed(&self) -> bool {
        which::which(&self.cli_path).is_ok()
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.registry.contains(conversation_id)
    }

    /// Cancel the exchange in progress for `conversation_id`.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.registry.signal(conversation_id)
    }

    /// Run one exchange to completion.
    ///
    /// Thinking and content events are published while the CLI runs. Exactly
    /// one terminal event (`Complete` or `Error`) follows, except when the
    /// conversation was busy: that exchange never started and publishes
    /// nothing, leaving the running one's stream intact.
    ///
    /// The exchange runs on its own task. Dropping the returned future does
    /// not abandon it: the CLI still runs until it exits or is cancelled, the
    /// MCP config is removed and the terminal event is published.
    pub async fn send(
        &self,
        conversation_id: &str,
        request: AssistantRequest,
    ) -> Result<AssistantReply, AssistantError> {
        let manager = self.clone();
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move { manager.run_exchange(&id, request).await });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                let err = AssistantError::Cli(format!("Exchange aborted: {}", e));
                warn!(conversation_id = %conversation_id, "{}", err);
                self.events.conversation(
                    conversation_id,
                    ConversationEvent::Error {
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn run_exchange(
        &self,
        conversation_id: &str,
        request: AssistantRequest,
    ) -> Result<AssistantReply, AssistantError> {
        let result = self.exchange(conversation_id, &request).await;
        match &result {
            Ok(reply) => {
                info!(
                    conversation_id = %conversation_id,
                    session_id = ?reply.session_id,
                    tokens_used = ?reply.tokens_used,
                    "Assistant exchange complete"
                );
                self.events.conversation(
                    conversation_id,
                    ConversationEvent::Complete {
                        session_id: reply.session_id.clone(),
                        tokens_used: reply.tokens_used,
                    },
                );
            }
            Err(AssistantError::Busy(_)) => {}
            Err(e) => {
                warn!(conversation_id = %conversation_id, "Assistant exchange failed: {}", e);
                self.events.conversation(
                    conversation_id,
                    ConversationEvent::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        result
    }

    async fn exchange(
        &self,
        conversation_id: &str,
        request: &AssistantRequest,
    ) -> Result<AssistantReply, AssistantError> {
        let cwd = resolve_working_dir(request.working_directory.as_deref())
            .map_err(AssistantError::InvalidDirectory)?;

        let group = ProcessGroup::new();
        let _registration = self
            .registry
            .register(conversation_id, ProcessKind::Assistant, group.clone())
            .map_err(|_| AssistantError::Busy(conversation_id.to_string()))?;

        let plan = IntegrationPlan::from_integrations(&request.integrations);
        let mcp_path = if plan.needs_config_file() {
            let path = mcp_config_path(conversation_id, cwd.as_deref());
            write_mcp_config(&path, &plan.mcp).await?;
            debug!(path = %path.display(), "Wrote MCP config");
            Some(path)
        } else {
            None
        };

        let result = self
            .run_cli(
                conversation_id,
                request,
                &plan,
                cwd.as_deref(),
                mcp_path.as_deref(),
                &group,
            )
            .await;

        if let Some(path) = &mcp_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), "Failed to remove MCP config: {}", e);
            }
        }
        result
    }

    async fn run_cli(
        &self,
        conversation_id: &str,
        request: &AssistantRequest,
        plan: &IntegrationPlan,
        cwd: Option<&Path>,
        mcp_path: Option<&Path>,
        group: &ProcessGroup,
    ) -> Result<AssistantReply, AssistantError> {
        let system_prompt = plan.system_prompt(request.system_prompt.as_deref());
        let args = build_args(request, system_prompt.as_deref(), mcp_path);

        let mut cmd = Command::new(&self.cli_path);
        cmd.args(&args)
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        isolate_process_group(&mut cmd);

        if group.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }

        info!(
            conversation_id = %conversation_id,
            cwd = ?cwd,
            resume = ?request.session_id,
            mcp_config = mcp_path.is_some(),
            "Spawning assistant CLI: {}",
            preview(&request.message, 80)
        );

        let mut child = cmd.spawn().map_err(AssistantError::Spawn)?;
        group.attach(child.id());

        let stderr_task = {
            let stderr = child.stderr.take();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_end(&mut buf).await;
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        };
        let stdout = child.stdout.take().ok_or_else(|| {
            AssistantError::Io(std::io::Error::other("assistant CLI stdout not captured"))
        })?;

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut acc = TurnAccumulator::new();
        loop {
            tokio::select! {
                line = read_line_lossy(&mut reader, &mut buf) => match line {
                    Ok(Some(line)) => {
                        for event in acc.feed_line(&line) {
                            self.events.conversation(conversation_id, event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conversation_id = %conversation_id, "Assistant output read failed: {}", e);
                        break;
                    }
                },
                _ = group.cancelled() => {
                    stop_child(&mut child, group).await;
                    return Err(AssistantError::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = group.cancelled() => {
                stop_child(&mut child, group).await;
                return Err(AssistantError::Cancelled);
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        let outcome = acc.finish();

        if !status.success() {
            let message = outcome
                .error
                .or_else(|| {
                    let stderr = stderr.trim();
                    (!stderr.is_empty()).then(|| format!("Assistant CLI error: {}", stderr))
                })
                .unwrap_or_else(|| format!("Assistant CLI exited with {}", status));
            return Err(AssistantError::Cli(message));
        }
        if let Some(error) = outcome.error {
            return Err(AssistantError::Cli(error));
        }
        if !outcome.saw_result {
            return Err(AssistantError::Cli(
                "Assistant CLI exited without a result".to_string(),
            ));
        }

        Ok(AssistantReply {
            response: outcome.response,
            session_id: outcome.session_id.or_else(|| request.session_id.clone()),
            tokens_used: outcome.tokens_used,
        })
    }
}

/// The group was already sent SIGTERM; escalate if the CLI lingers.
async fn stop_child(child: &mut Child, group: &ProcessGroup) {
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("Assistant CLI ignored SIGTERM, killing group");
        group.kill();
        let _ = child.wait().await;
    }
    group.kill();
}
