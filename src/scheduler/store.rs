//! Best-effort JSON snapshot of the task list.

use std::path::{Path, PathBuf};

use super::types::ScheduledTask;
use super::SchedulerError;

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    path: PathBuf,
}

impl TaskSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load tasks. A missing file is an empty list.
    pub async fn load(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SchedulerError::Snapshot(format!("{}: {}", self.path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| SchedulerError::Snapshot(format!("{}: {}", self.path.display(), e)))
    }

    pub async fn save(&self, tasks: &[ScheduledTask]) -> Result<(), SchedulerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SchedulerError::Snapshot(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(tasks)
            .map_err(|e| SchedulerError::Snapshot(e.to_string()))?;
        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| SchedulerError::Snapshot(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{TaskKind, TaskSpec};

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = TaskSnapshot::new(dir.path().join("nope.json"));
        assert!(snapshot.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_creates_parent_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = TaskSnapshot::new(dir.path().join("nested/scheduled_tasks.json"));
        let task = ScheduledTask::new(
            "t1".into(),
            TaskSpec {
                name: "ping".into(),
                kind: TaskKind::Shell {
                    command: "echo ping".into(),
                    working_directory: None,
                },
                interval_minutes: 3,
                enabled: true,
            },
        );
        snapshot.save(std::slice::from_ref(&task)).await.unwrap();
        assert_eq!(snapshot.load().await.unwrap(), vec![task]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduled_tasks.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = TaskSnapshot::new(path).load().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Snapshot(_)));
    }
}
