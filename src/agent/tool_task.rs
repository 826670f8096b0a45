// Scheduler task for one tool call
//
// Only decided calls reach the scheduler; the approval wait happens before
// submission. The task moves the call to Running and hands it to the
// executor, racing it against the call's own cancellation. Failures are
// returned to the scheduler so they can be retried; the loop settles failed
// and cancelled calls after the batch.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::TransitionError;
use crate::scheduler::{AttemptContext, TaskHandler};
use crate::toolcall::{ToolCall, ToolCallState};
use crate::tools::ToolExecutor;

/// What happened to a tool call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Completed(String),
    Denied,
    /// Cancelled individually while the batch kept going
    Cancelled,
}

pub(crate) struct ToolCallTask {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolCallTask {
    pub(crate) fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl TaskHandler<ToolCall> for ToolCallTask {
    type Output = ToolOutcome;

    async fn run(&self, call: Arc<ToolCall>, ctx: AttemptContext) -> Result<ToolOutcome> {
        match call.state() {
            ToolCallState::Pending | ToolCallState::PermissionApproved => {
                if let Err(err) = call.start().await {
                    return settle_lost_race(&call, err);
                }
            }
            // Retry of an attempt that already started
            ToolCallState::Running => {}
            ToolCallState::PermissionDenied => return Ok(ToolOutcome::Denied),
            ToolCallState::Cancelled => return Ok(ToolOutcome::Cancelled),
            ToolCallState::PermissionPending => {
                bail!("tool call {} submitted before a permission decision", call.id())
            }
            state @ (ToolCallState::Completed | ToolCallState::Failed) => {
                bail!("tool call {} already finished ({})", call.id(), state)
            }
        }

        // Fires on batch cancellation or when this call alone is cancelled
        let token = ctx.cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = call.cancelled() => {
                token.cancel();
                debug!(id = %call.id(), "Tool call cancelled while running");
                return Ok(ToolOutcome::Cancelled);
            }
            result = self.executor.execute(call.tool_use(), token.clone()) => result,
        };

        let output = match result {
            Ok(output) => output,
            // Error caused by the cancellation itself; not worth a retry
            Err(_) if call.is_cancelled() => return Ok(ToolOutcome::Cancelled),
            Err(err) => return Err(err),
        };

        match call.complete(output.clone()).await {
            Ok(()) => Ok(ToolOutcome::Completed(output)),
            Err(err) => settle_lost_race(&call, err),
        }
    }
}

/// Another party moved the call first; only a cancellation is expected here.
fn settle_lost_race(call: &ToolCall, err: TransitionError) -> Result<ToolOutcome> {
    if call.state() == ToolCallState::Cancelled {
        debug!(id = %call.id(), "Tool call cancelled while running");
        return Ok(ToolOutcome::Cancelled);
    }
    Err(err.into())
}
