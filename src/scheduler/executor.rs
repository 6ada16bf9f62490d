//! Task runs backed by the shell executor and the assistant session manager.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::types::{ScheduledTask, TaskKind, TaskRunOutcome};
use super::TaskExecutor;
use crate::assistant::{AssistantRequest, SessionManager};
use crate::process::ShellExecutor;
use crate::quest::{ConversationStore, Exchange};

/// Shell tasks run in the home directory unless told otherwise.
const DEFAULT_TASK_DIR: &str = "~";

pub struct RuntimeTaskExecutor {
    shell: ShellExecutor,
    assistant: SessionManager,
    conversations: Arc<dyn ConversationStore>,
}

impl RuntimeTaskExecutor {
    pub fn new(
        shell: ShellExecutor,
        assistant: SessionManager,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            shell,
            assistant,
            conversations,
        }
    }

    async fn run_shell(
        &self,
        task: &ScheduledTask,
        command: &str,
        working_directory: Option<&str>,
    ) -> TaskRunOutcome {
        let token = format!("scheduled-{}", task.id);
        let dir = working_directory
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(DEFAULT_TASK_DIR);
        match self.shell.run(&token, command, Some(dir)).await {
            Ok(out) => {
                let mut combined = out.stdout.clone();
                if !out.stderr.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&out.stderr);
                }
                if out.success() {
                    TaskRunOutcome::success(combined)
                } else {
                    TaskRunOutcome::error(combined)
                }
            }
            Err(e) => TaskRunOutcome::error(e.to_string()),
        }
    }

    async fn run_prompt(
        &self,
        task: &ScheduledTask,
        prompt: &str,
        context_ids: &[String],
    ) -> TaskRunOutcome {
        let context = match context_ids.first() {
            Some(id) => match self.conversations.get(id).await {
                Some(conversation) => Some(conversation),
                None => {
                    warn!(task_id = %task.id, conversation_id = %id, "Context conversation not found");
                    None
                }
            },
            None => None,
        };

        let conversation_id = context
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_else(|| format!("scheduled-{}", task.id));
        let request = AssistantRequest {
            message: prompt.to_string(),
            session_id: context.as_ref().and_then(|c| c.session_id.clone()),
            working_directory: context.as_ref().and_then(|c| c.working_directory.clone()),
            ..Default::default()
        };

        match self.assistant.send(&conversation_id, request).await {
            Ok(reply) => {
                if context.is_some() {
                    self.conversations
                        .append_exchange(
                            &conversation_id,
                            Exchange {
                                prompt: prompt.to_string(),
                                response: reply.response.clone(),
                                session_id: reply.session_id.clone(),
                                task_id: Some(task.id.clone()),
                            },
                        )
                        .await;
                }
                TaskRunOutcome::success(reply.response)
            }
            Err(e) => TaskRunOutcome::error(e.to_string()),
        }
    }
}

#[async_trait]
impl TaskExecutor for RuntimeTaskExecutor {
    async fn execute(&self, task: &ScheduledTask) -> TaskRunOutcome {
        match &task.kind {
            TaskKind::Shell {
                command,
                working_directory,
            } => {
                self.run_shell(task, command, working_directory.as_deref())
                    .await
            }
            TaskKind::Prompt {
                prompt,
                context_conversation_ids,
            } => self.run_prompt(task, prompt, context_conversation_ids).await,
        }
    }
}
