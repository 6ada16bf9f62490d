//! NDJSON events printed by the assistant CLI in `stream-json` mode, and the
//! accumulator that turns them into conversation events.

use serde::Deserialize;
use serde_json::Value;

use crate::events::ConversationEvent;

/// Events emitted by the CLI, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    #[serde(rename = "error")]
    Error(ErrorEvent),
    /// `user` tool results, `stream_event` partials and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

impl Usage {
    /// `total_tokens` if reported, else input + output.
    pub fn total(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub stats: Option<Usage>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    fn token_total(&self) -> u64 {
        let from_usage = self.usage.as_ref().map(Usage::total).unwrap_or(0);
        if from_usage > 0 {
            return from_usage;
        }
        self.stats.as_ref().map(Usage::total).unwrap_or(0)
    }

    fn error_message(&self) -> String {
        self.result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.errors.first().map(String::as_str).filter(|s| !s.is_empty()))
            .unwrap_or("Unknown error")
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorEvent {
    /// `error.message`, a bare `error` string, or the top-level `message`.
    pub fn text(&self) -> Option<String> {
        if let Some(err) = &self.error {
            let msg = err
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| err.as_str())
                .unwrap_or("Unknown error");
            return Some(msg.to_string());
        }
        self.message.clone()
    }
}

/// What one CLI turn produced once its output is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub response: String,
    pub session_id: Option<String>,
    pub tokens_used: Option<u64>,
    pub error: Option<String>,
    pub saw_result: bool,
}

/// Folds CLI events of one turn into streamed conversation events and a
/// final outcome.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    response: String,
    streamed_text: bool,
    init_session_id: Option<String>,
    result_session_id: Option<String>,
    tokens: u64,
    error: Option<String>,
    saw_result: bool,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw output line. Lines that are not CLI events are skipped.
    pub fn feed_line(&mut self, line: &str) -> Vec<ConversationEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<CliEvent>(trimmed) {
            Ok(event) => self.feed(event),
            Err(e) => {
                tracing::debug!(
                    "Skipping non-event CLI line: {} - {}",
                    e,
                    crate::util::preview(trimmed, 200)
                );
                Vec::new()
            }
        }
    }

    pub fn feed(&mut self, event: CliEvent) -> Vec<ConversationEvent> {
        let mut out = Vec::new();
        match event {
            CliEvent::System(sys) => {
                if sys.subtype.as_deref() == Some("init") {
                    self.init_session_id = sys.session_id;
                }
                if let Some(msg) = sys.message {
                    if msg.to_lowercase().contains("error") {
                        self.error = Some(msg);
                    }
                }
            }
            CliEvent::Assistant(evt) => {
                for block in evt.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                self.response.push_str(&text);
                                self.streamed_text = true;
                                out.push(ConversationEvent::Content { fragment: text });
                            }
                        }
                        ContentBlock::Thinking { thinking } => {
                            if !thinking.is_empty() {
                                out.push(ConversationEvent::Thinking { text: thinking });
                            }
                        }
                        ContentBlock::ToolUse { name } => {
                            let tool = name.as_deref().unwrap_or("tool");
                            out.push(ConversationEvent::Thinking {
                                text: format!("Using {}...", tool),
                            });
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            CliEvent::Result(res) => {
                self.saw_result = true;
                if res.is_error || res.subtype.as_deref() == Some("error") {
                    self.error = Some(res.error_message());
                } else if !self.streamed_text {
                    if let Some(text) = res.result.as_deref() {
                        self.response = text.to_string();
                    }
                }
                if res.session_id.is_some() {
                    self.result_session_id = res.session_id.clone();
                }
                let total = res.token_total();
                if total > 0 {
                    self.tokens = total;
                }
            }
            CliEvent::Error(err) => {
                if let Some(msg) = err.text() {
                    self.error = Some(msg);
                }
            }
            CliEvent::Other => {}
        }
        out
    }

    pub fn finish(self) -> TurnOutcome {
        TurnOutcome {
            response: self.response.trim().to_string(),
            session_id: self.result_session_id.or(self.init_session_id),
            tokens_used: (self.tokens > 0).then_some(self.tokens),
            error: self.error,
            saw_result: self.saw_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_blocks_map_to_events() {
        let mut acc = TurnAccumulator::new();
        let events = acc.feed_line(
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}},{"type":"text","text":"Hello "}]},"session_id":"s1"}"#,
        );
        assert_eq!(
            events,
            vec![
                ConversationEvent::Thinking { text: "hmm".into() },
                ConversationEvent::Thinking {
                    text: "Using Bash...".into()
                },
                ConversationEvent::Content {
                    fragment: "Hello ".into()
                },
            ]
        );
        let more = acc.feed_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"world"}]}}"#,
        );
        assert_eq!(more.len(), 1);

        acc.feed_line(r#"{"type":"result","subtype":"success","result":"ignored","session_id":"s1","is_error":false,"usage":{"input_tokens":12,"output_tokens":30}}"#);
        let outcome = acc.finish();
        assert_eq!(outcome.response, "Hello world");
        assert_eq!(outcome.session_id.as_deref(), Some("s1"));
        assert_eq!(outcome.tokens_used, Some(42));
        assert!(outcome.saw_result);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn result_text_is_used_when_nothing_streamed() {
        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"result","subtype":"success","result":"  final answer \n","session_id":"s2","usage":{"total_tokens":99,"input_tokens":1}}"#);
        let outcome = acc.finish();
        assert_eq!(outcome.response, "final answer");
        assert_eq!(outcome.tokens_used, Some(99));
    }

    #[test]
    fn stats_are_a_token_fallback_and_zero_is_absent() {
        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"result","result":"x","stats":{"input_tokens":3,"output_tokens":4}}"#);
        assert_eq!(acc.finish().tokens_used, Some(7));

        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"result","result":"x"}"#);
        assert_eq!(acc.finish().tokens_used, None);
    }

    #[test]
    fn errors_are_recorded_from_every_source() {
        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"error","error":{"message":"rate limited"}}"#);
        assert_eq!(acc.finish().error.as_deref(), Some("rate limited"));

        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"system","subtype":"warning","message":"Auth error: not logged in"}"#);
        assert_eq!(
            acc.finish().error.as_deref(),
            Some("Auth error: not logged in")
        );

        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"","errors":["session not found"]}"#);
        assert_eq!(acc.finish().error.as_deref(), Some("session not found"));
    }

    #[test]
    fn init_session_id_is_a_fallback() {
        let mut acc = TurnAccumulator::new();
        acc.feed_line(r#"{"type":"system","subtype":"init","session_id":"from-init","tools":["Bash"]}"#);
        acc.feed_line(r#"{"type":"result","result":"ok"}"#);
        assert_eq!(acc.finish().session_id.as_deref(), Some("from-init"));
    }

    #[test]
    fn junk_and_unknown_events_are_ignored() {
        let mut acc = TurnAccumulator::new();
        assert!(acc.feed_line("npm WARN something").is_empty());
        assert!(acc.feed_line("").is_empty());
        assert!(acc
            .feed_line(r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t","content":"x"}]}}"#)
            .is_empty());
        assert!(acc
            .feed_line(r#"{"type":"stream_event","event":{"type":"message_stop"}}"#)
            .is_empty());
        let outcome = acc.finish();
        assert!(!outcome.saw_result);
        assert!(outcome.response.is_empty());
    }
}
