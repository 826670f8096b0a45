// Task status and batch results

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::classify::ErrorClass;

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Last error seen by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one task in a batch
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<O> {
    /// Position in the submitted batch
    pub index: usize,
    pub status: TaskStatus,
    pub output: Option<O>,
    pub error: Option<TaskFailure>,
    /// Attempts actually made; 0 when the task never started
    pub attempts: u32,
    pub duration: Duration,
    /// Failed on a retryable error with no attempts left
    pub exhausted_retries: bool,
}

impl<O> TaskResult<O> {
    /// Result for a task the batch never got to
    pub(crate) fn not_started(index: usize) -> Self {
        Self {
            index,
            status: TaskStatus::Cancelled,
            output: None,
            error: None,
            attempts: 0,
            duration: Duration::ZERO,
            exhausted_retries: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Aggregate counts over a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_retries: u32,
    pub duration: Duration,
}

impl BatchSummary {
    pub fn from_results<O>(results: &[TaskResult<O>], duration: Duration) -> Self {
        let mut summary = BatchSummary {
            total: results.len(),
            duration,
            ..Default::default()
        };

        for result in results {
            match result.status {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                TaskStatus::Queued | TaskStatus::Running => {}
            }
            summary.total_retries += result.retries();
        }

        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}
