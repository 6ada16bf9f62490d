//! # Quest Runtime
//!
//! Process and session orchestration for assistant-backed quests.
//!
//! This library provides:
//! - A process registry that binds caller tokens to live child processes
//! - Cancellable one-shot shell commands and long-running background services
//! - Assistant exchanges over the `claude` CLI with session continuity
//! - A recurring task scheduler driving shell commands and assistant prompts
//! - An HTTP + SSE surface for the UI
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐      ┌──────────────────┐
//!   │  Scheduler   │─────▶│  TaskExecutor    │
//!   └──────────────┘      └───┬──────────┬───┘
//!                             │          │
//!                             ▼          ▼
//!   ┌──────────────┐  ┌─────────────┐ ┌────────────────┐
//!   │ServiceRunner │  │ShellExecutor│ │ SessionManager │
//!   └──────┬───────┘  └──────┬──────┘ └───────┬────────┘
//!          │                 │                │
//!          ▼                 ▼                ▼
//!   ┌─────────────────────────────────────────────────┐
//!   │        ProcessRegistry (token → process)        │
//!   └─────────────────────────────────────────────────┘
//! ```
//!
//! Output, conversation progress and task results flow through one
//! [`events::EventBus`].
//!
//! ## Modules
//! - `process`: registry, shell executor, service runner
//! - `assistant`: CLI-backed assistant sessions
//! - `scheduler`: recurring tasks
//! - `quest`: conversation records
//! - `api`: HTTP routes

pub mod api;
pub mod assistant;
pub mod config;
pub mod events;
pub mod process;
pub mod quest;
pub mod scheduler;
pub mod util;

pub use config::Config;
pub use events::{ConversationEvent, EventBus, ProcessOutput, QuestEvent};
pub use process::{ProcessRegistry, ServiceRunner, ShellExecutor};
