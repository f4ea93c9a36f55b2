//! Task registry: the authoritative record of work items and their state.
//!
//! ```text
//! queued ──▶ running ──▶ succeeded
//!    │          │
//!    └──────────┴──────▶ failed
//! ```
//!
//! Terminal states are sticky. A status report arriving after `succeeded`
//! or `failed` is rejected with [`RegistryError::Finalized`]; log snippet
//! updates are still accepted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use vertera_proto::{TaskEnvelope, TaskSpec};

/// Lifecycle position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet picked up.
    Queued,
    /// An agent reported progress.
    Running,
    /// Completed.
    Succeeded,
    /// Failed; `error` holds the reason.
    Failed,
}

impl TaskStatus {
    /// `succeeded` or `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier.
    pub id: String,
    /// Owning host.
    pub host_id: String,
    /// Type tag and parameters.
    #[serde(flatten)]
    pub spec: TaskSpec,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Most recent log snippet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First `running` report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// The part of the task an agent needs.
    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            spec: self.spec.clone(),
        }
    }
}

/// Registry mutation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No task with this id.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// The task already reached a terminal state.
    #[error("Task {id} is already {status}")]
    Finalized {
        /// Task id.
        id: String,
        /// Terminal state it holds.
        status: TaskStatus,
    },
}

/// Concurrent task table.
///
/// Each mutation runs under the entry's shard lock, so mutations of one task
/// are linearizable and readers only ever clone fully-applied records.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Task>,
}

impl TaskRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `queued` task for `host_id`.
    pub fn create(&self, host_id: &str, spec: TaskSpec) -> Task {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            host_id: host_id.to_string(),
            spec,
            status: TaskStatus::Queued,
            logs: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.tasks.insert(task.id.clone(), task.clone());

        telemetry_metrics::counter!("vertera_tasks_created_total", "type" => task.spec.type_name())
            .increment(1);
        debug!(task_id = %task.id, host_id, task_type = task.spec.type_name(), "Task created");
        task
    }

    /// Snapshot of a task.
    pub fn get(&self, id: &str) -> Result<Task, RegistryError> {
        self.tasks
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Number of tasks held.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` when no task was created yet.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Move to `running`; `started_at` is stamped on the first call only.
    pub fn mark_running(&self, id: &str) -> Result<Task, RegistryError> {
        self.transition(id, |task, now| {
            task.status = TaskStatus::Running;
            task.started_at.get_or_insert(now);
        })
    }

    /// Move to `succeeded`, clearing any earlier error.
    pub fn mark_succeeded(&self, id: &str) -> Result<Task, RegistryError> {
        self.transition(id, |task, now| {
            task.status = TaskStatus::Succeeded;
            task.finished_at = Some(now);
            task.error = None;
        })
    }

    /// Move to `failed` with `message`.
    pub fn mark_failed(&self, id: &str, message: &str) -> Result<Task, RegistryError> {
        self.transition(id, |task, now| {
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now);
            task.error = Some(message.to_string());
        })
    }

    /// Replace the stored log snippet. Last write wins.
    pub fn append_log(&self, id: &str, text: &str) -> Result<(), RegistryError> {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        task.logs = Some(text.to_string());
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Task, DateTime<Utc>),
    ) -> Result<Task, RegistryError> {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if task.status.is_terminal() {
            return Err(RegistryError::Finalized {
                id: id.to_string(),
                status: task.status,
            });
        }
        apply(&mut task, Utc::now());
        debug!(task_id = id, status = %task.status, "Task transitioned");
        Ok(task.clone())
    }
}
