//! Runtime task state. Deliberately holds no handle to the scheduler or
//! orchestrator — those own the transitions; this is just the snapshot
//! they transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Queued,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            TaskState::Created
                | TaskState::Queued
                | TaskState::Scheduled
                | TaskState::Running
                | TaskState::Paused
        )
    }

    pub fn can_restart(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub property: Option<String>,
    pub cause_chain: Vec<String>,
    /// Teardown failures collected while recovering from `message`;
    /// these never replace the primary error.
    pub suppressed: Vec<String>,
}

impl TaskError {
    pub fn from_error(err: &crate::error::Error) -> Self {
        let mut cause_chain = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(s) = source {
            cause_chain.push(s.to_string());
            source = s.source();
        }
        TaskError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            property: err.property().map(|s| s.to_string()),
            cause_chain,
            suppressed: Vec::new(),
        }
    }
}

/// The runtime instance of driving a `JobProfile` through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: TaskId,
    pub job_profile_id: i64,
    pub job_name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    #[serde(skip)]
    pub locked_resources: Vec<ResourceKey>,
    pub last_error: Option<TaskError>,
    pub output_path: Option<std::path::PathBuf>,
}

impl TaskExecution {
    pub fn new(job_profile_id: i64, job_name: impl Into<String>, priority: Priority) -> Self {
        Self {
            task_id: TaskId::new(),
            job_profile_id,
            job_name: job_name.into(),
            state: TaskState::Created,
            priority,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            progress: Progress::default(),
            locked_resources: Vec::new(),
            last_error: None,
            output_path: None,
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.state.can_cancel()
    }

    pub fn can_restart(&self) -> bool {
        self.state.can_restart()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn execution_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
