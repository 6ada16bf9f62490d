//! Assistant exchange and conversation endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::assistant::{AssistantError, AssistantReply, AssistantRequest};
use crate::quest::{Conversation, Exchange};

use super::routes::AppState;
use super::types::{InstalledResponse, SignalResponse, UpsertConversationRequest};

fn assistant_error(e: AssistantError) -> (StatusCode, String) {
    let status = match &e {
        AssistantError::Busy(_) | AssistantError::Cancelled => StatusCode::CONFLICT,
        AssistantError::InvalidDirectory(_) | AssistantError::Spawn(_) => StatusCode::BAD_REQUEST,
        AssistantError::Cli(_) => StatusCode::BAD_GATEWAY,
        AssistantError::McpConfig(_) | AssistantError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub async fn installed(State(state): State<Arc<AppState>>) -> Json<InstalledResponse> {
    Json(InstalledResponse {
        installed: state.assistant.is_installed(),
        cli_path: state.config.cli_path.clone(),
    })
}

/// Send one message and wait for the full reply. Progress streams over
/// `/api/events` meanwhile.
///
/// A known conversation supplies the working directory and session token when
/// the request omits them, and records the exchange afterwards.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(mut req): Json<AssistantRequest>,
) -> Result<Json<AssistantReply>, (StatusCode, String)> {
    let stored = state.conversations.get(&conversation_id).await;
    if let Some(conv) = &stored {
        if req.working_directory.is_none() {
            req.working_directory = conv.working_directory.clone();
        }
        if req.session_id.is_none() {
            req.session_id = conv.session_id.clone();
        }
    }

    let prompt = req.message.clone();
    let reply = state
        .assistant
        .send(&conversation_id, req)
        .await
        .map_err(assistant_error)?;

    if stored.is_some() {
        state
            .conversations
            .append_exchange(
                &conversation_id,
                Exchange {
                    prompt,
                    response: reply.response.clone(),
                    session_id: reply.session_id.clone(),
                    task_id: None,
                },
            )
            .await;
    }
    Ok(Json(reply))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Json<SignalResponse> {
    Json(SignalResponse {
        signalled: state.assistant.cancel(&conversation_id),
    })
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, (StatusCode, String)> {
    state
        .conversations
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Conversation {} not found", id)))
}

/// Create or update a conversation record.
pub async fn put_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpsertConversationRequest>,
) -> Json<Conversation> {
    let mut conv = state
        .conversations
        .get(&id)
        .await
        .unwrap_or_else(|| Conversation {
            id: id.clone(),
            ..Default::default()
        });
    if req.working_directory.is_some() {
        conv.working_directory = req.working_directory;
    }
    if req.session_id.is_some() {
        conv.session_id = req.session_id;
    }
    if let Some(messages) = req.messages {
        conv.messages = messages;
    }
    state.conversations.put(conv.clone()).await;
    Json(conv)
}
