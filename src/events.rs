//! Push events streamed to the UI.
//!
//! Every producer publishes into a single [`EventBus`]. Within one producer
//! (one service run, one assistant exchange) events are sent from a single
//! task, so a subscriber sees them in emission order. Nothing is promised
//! across producers.

use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::TaskStatus;

/// Output of a background service, one line per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub source_id: String,
    /// Line text, `None` on the completion event.
    pub text: Option<String>,
    pub is_stderr: bool,
    pub is_complete: bool,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn line(source_id: &str, text: String, is_stderr: bool) -> Self {
        Self {
            source_id: source_id.to_string(),
            text: Some(text),
            is_stderr,
            is_complete: false,
            exit_code: None,
        }
    }

    pub fn complete(source_id: &str, exit_code: Option<i32>) -> Self {
        Self {
            source_id: source_id.to_string(),
            text: None,
            is_stderr: false,
            is_complete: true,
            exit_code,
        }
    }
}

/// One streamed step of an assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// Status text; replaces any previous thinking text.
    Thinking { text: String },
    /// Response fragment; fragments concatenate in arrival order.
    Content { fragment: String },
    /// Exchange finished successfully.
    Complete {
        session_id: Option<String>,
        tokens_used: Option<u64>,
    },
    /// Exchange failed. Terminal.
    Error { message: String },
}

impl ConversationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationEvent::Complete { .. } | ConversationEvent::Error { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestEvent {
    Process(ProcessOutput),
    Conversation {
        conversation_id: String,
        event: ConversationEvent,
    },
    TaskUpdated {
        task_id: String,
        status: TaskStatus,
        has_unseen_output: bool,
    },
}

impl QuestEvent {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            QuestEvent::Process(_) => "process_output",
            QuestEvent::Conversation { .. } => "conversation",
            QuestEvent::TaskUpdated { .. } => "task_updated",
        }
    }
}

/// Fan-out of [`QuestEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QuestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: QuestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn process_output(&self, output: ProcessOutput) {
        self.publish(QuestEvent::Process(output));
    }

    pub fn conversation(&self, conversation_id: &str, event: ConversationEvent) {
        self.publish(QuestEvent::Conversation {
            conversation_id: conversation_id.to_string(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuestEvent> {
        self.tx.subscribe()
    }

    /// Events of one conversation. The stream ends after the first terminal
    /// event (`Complete` or `Error`).
    pub fn subscribe_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Stream<Item = ConversationEvent> + Send + 'static {
        let mut rx = self.tx.subscribe();
        let wanted = conversation_id.to_string();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(QuestEvent::Conversation { conversation_id, event }) if conversation_id == wanted => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(conversation_id = %wanted, skipped, "Conversation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Output events of one service. The stream ends after the completion
    /// event of the current run.
    pub fn subscribe_source(
        &self,
        source_id: &str,
    ) -> impl Stream<Item = ProcessOutput> + Send + 'static {
        let mut rx = self.tx.subscribe();
        let wanted = source_id.to_string();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(QuestEvent::Process(output)) if output.source_id == wanted => {
                        let done = output.is_complete;
                        yield output;
                        if done {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(source_id = %wanted, skipped, "Service subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn conversation_stream_filters_and_stops_at_terminal_event() {
        let bus = EventBus::default();
        let stream = bus.subscribe_conversation("a");

        bus.conversation("b", ConversationEvent::Content { fragment: "other".into() });
        bus.conversation("a", ConversationEvent::Thinking { text: "hmm".into() });
        bus.conversation("a", ConversationEvent::Content { fragment: "hi".into() });
        bus.conversation(
            "a",
            ConversationEvent::Complete {
                session_id: Some("s1".into()),
                tokens_used: None,
            },
        );
        bus.conversation("a", ConversationEvent::Content { fragment: "late".into() });

        let events: Vec<_> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                ConversationEvent::Thinking { text: "hmm".into() },
                ConversationEvent::Content { fragment: "hi".into() },
                ConversationEvent::Complete {
                    session_id: Some("s1".into()),
                    tokens_used: None
                },
            ]
        );
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = QuestEvent::Conversation {
            conversation_id: "c1".into(),
            event: ConversationEvent::Thinking { text: "Using Bash...".into() },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation");
        assert_eq!(json["event"]["kind"], "thinking");
        assert_eq!(event.event_name(), "conversation");

        let done = QuestEvent::Process(ProcessOutput::complete("svc", Some(0)));
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "process");
        assert_eq!(json["is_complete"], true);
        assert!(json["text"].is_null());
    }
}
