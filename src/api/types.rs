//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::process::{ProcessInfo, ServiceStatus};
use crate::quest::ConversationMessage;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Tokens currently bound in the process registry
    pub running_processes: usize,
    pub processes: Vec<ProcessInfo>,
    pub scheduler_enabled: bool,
}

/// Request to run a one-shot shell command.
#[derive(Debug, Clone, Deserialize)]
pub struct RunShellRequest {
    /// Caller-chosen token; used to kill the command while it runs
    pub token: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Result of a best-effort cancellation request.
#[derive(Debug, Clone, Serialize)]
pub struct SignalResponse {
    /// Whether something was bound to the token
    pub signalled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartServiceRequest {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesResponse {
    pub running: Vec<String>,
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledResponse {
    pub installed: bool,
    pub cli_path: String,
}

/// Partial conversation update. Omitted fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpsertConversationRequest {
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ConversationMessage>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunTaskResponse {
    /// `false` when the re-entry guard skipped the run
    pub started: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HomeResponse {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathQuery {
    /// Defaults to the home directory
    #[serde(default)]
    pub path: Option<String>,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}
