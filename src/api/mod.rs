//! HTTP API for the quest runtime.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check with the registered processes
//! - `GET /api/events` - SSE stream of process, conversation and task events
//! - `POST /api/shell/run` - Run a shell command to completion
//! - `POST /api/shell/{token}/kill` - Cancel a running command
//! - `GET /api/services` - List running background services
//! - `POST /api/services` - Start a background service
//! - `POST /api/services/{id}/stop` - Stop a background service
//! - `GET /api/services/{id}/output` - Buffered output of a service
//! - `GET /api/assistant/installed` - Whether the assistant CLI is available
//! - `POST /api/assistant/{conversation_id}/messages` - Run one assistant exchange
//! - `POST /api/assistant/{conversation_id}/cancel` - Cancel the exchange in progress
//! - `GET /api/conversations/{id}` - Get a conversation record
//! - `PUT /api/conversations/{id}` - Create or update a conversation record
//! - `GET /api/tasks` - List scheduled tasks
//! - `POST /api/tasks` - Create a scheduled task
//! - `GET /api/tasks/{id}` - Get a scheduled task
//! - `PUT /api/tasks/{id}` - Edit a scheduled task
//! - `DELETE /api/tasks/{id}` - Delete a scheduled task
//! - `POST /api/tasks/{id}/enable` - Enable a task (runs immediately)
//! - `POST /api/tasks/{id}/disable` - Disable a task
//! - `POST /api/tasks/{id}/seen` - Clear the unseen-output flag
//! - `POST /api/tasks/{id}/run` - Run a task now
//! - `GET /api/fs/home` - Home directory
//! - `GET /api/fs/list` - List a directory

mod assistant;
mod fs;
mod processes;
mod routes;
mod tasks;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
