//! Conversation ("quest") records as seen by the orchestration core.
//!
//! The UI owns conversations. The core only needs a conversation's working
//! directory and session token, and a way to append an exchange when a
//! scheduled prompt runs in a conversation's context.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set when the message was produced by a scheduled task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            task_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Assistant session token from the last exchange.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

/// One prompt/response pair produced outside the UI.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub prompt: String,
    pub response: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Option<Conversation>;

    async fn put(&self, conversation: Conversation);

    /// Append `exchange` to the conversation's history and adopt its session
    /// token. Returns `false` if the conversation is unknown.
    async fn append_exchange(&self, id: &str, exchange: Exchange) -> bool;
}

/// In-memory conversation store.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    async fn put(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    async fn append_exchange(&self, id: &str, exchange: Exchange) -> bool {
        let mut conversations = self.conversations.write().await;
        let Some(conversation) = conversations.get_mut(id) else {
            return false;
        };
        let mut prompt = ConversationMessage::new(MessageRole::User, exchange.prompt);
        prompt.task_id = exchange.task_id.clone();
        let mut response = ConversationMessage::new(MessageRole::Assistant, exchange.response);
        response.task_id = exchange.task_id;
        conversation.messages.push(prompt);
        conversation.messages.push(response);
        if exchange.session_id.is_some() {
            conversation.session_id = exchange.session_id;
        }
        true
    }
}
