// Progress notifications for a running batch

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use super::classify::ErrorClass;
use super::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskProgress {
    Started {
        index: usize,
        attempt: u32,
    },
    /// About to sleep before `attempt`
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        class: ErrorClass,
    },
    Finished {
        index: usize,
        status: TaskStatus,
        attempts: u32,
    },
}

/// Best-effort progress sink. A full or closed channel is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressSink {
    tx: Option<mpsc::Sender<TaskProgress>>,
}

impl ProgressSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<TaskProgress>>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, event: TaskProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}
