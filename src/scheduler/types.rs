//! Scheduled task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
}

/// What a task does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Shell {
        command: String,
        /// Defaults to `~`.
        #[serde(default)]
        working_directory: Option<String>,
    },
    Prompt {
        prompt: String,
        /// The first entry supplies working directory and session.
        #[serde(default)]
        context_conversation_ids: Vec<String>,
    },
}

/// User-editable part of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub interval_minutes: u32,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub interval_minutes: u32,
    pub enabled: bool,
    /// Start time of the most recent completed run.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_output: Option<String>,
    #[serde(default)]
    pub last_status: Option<TaskStatus>,
    #[serde(default)]
    pub has_unseen_output: bool,
}

impl ScheduledTask {
    pub fn new(id: String, spec: TaskSpec) -> Self {
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            interval_minutes: spec.interval_minutes,
            enabled: spec.enabled,
            last_run: None,
            last_output: None,
            last_status: None,
            has_unseen_output: false,
        }
    }

    /// Replace the user-editable fields, keeping run history.
    pub fn apply(&mut self, spec: TaskSpec) {
        self.name = spec.name;
        self.kind = spec.kind;
        self.interval_minutes = spec.interval_minutes;
        self.enabled = spec.enabled;
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}

/// What one run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunOutcome {
    pub output: String,
    pub status: TaskStatus,
}

impl TaskRunOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            status: TaskStatus::Success,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            status: TaskStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_json_is_flat_with_type_tag() {
        let raw = r#"{
            "name": "disk",
            "type": "shell",
            "command": "df -h",
            "interval_minutes": 5,
            "enabled": true
        }"#;
        let spec: TaskSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(
            spec.kind,
            TaskKind::Shell {
                command: "df -h".into(),
                working_directory: None
            }
        );

        let task = ScheduledTask::new("t1".into(), spec);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "shell");
        assert_eq!(json["command"], "df -h");
        assert_eq!(json["has_unseen_output"], false);
        assert_eq!(task.interval().as_secs(), 300);
    }

    #[test]
    fn apply_keeps_history() {
        let mut task = ScheduledTask::new(
            "t1".into(),
            TaskSpec {
                name: "a".into(),
                kind: TaskKind::Prompt {
                    prompt: "status?".into(),
                    context_conversation_ids: vec!["q1".into()],
                },
                interval_minutes: 10,
                enabled: true,
            },
        );
        task.last_status = Some(TaskStatus::Error);
        task.has_unseen_output = true;

        task.apply(TaskSpec {
            name: "b".into(),
            kind: TaskKind::Shell {
                command: "true".into(),
                working_directory: Some("/tmp".into()),
            },
            interval_minutes: 1,
            enabled: false,
        });
        assert_eq!(task.name, "b");
        assert_eq!(task.last_status, Some(TaskStatus::Error));
        assert!(task.has_unseen_output);
    }
}
