// A single tool invocation and its guarded lifecycle
//
// The state lives in one watch cell. Every transition is checked and
// committed inside `send_if_modified`, so the approval path and the worker
// path can race on the same call and exactly one of them wins. Commit and
// publish happen under a per-call async lock so subscribers see transitions
// in commit order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::state::ToolCallState;
use crate::errors::TransitionError;
use crate::events::{AgentEvent, EventBroker, PermissionRequest, ToolCallUpdate};
use crate::pubsub::EventKind;
use crate::tools::ToolUse;

/// Everything about a call that changes over its lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallSnapshot {
    pub state: ToolCallState,
    /// Set by `start()`; elapsed-time display is left to the consumer
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolCallSnapshot {
    fn pending() -> Self {
        Self {
            state: ToolCallState::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

struct ToolCallInner {
    tool_use: ToolUse,
    session_id: String,
    created_at: DateTime<Utc>,
    cell: watch::Sender<ToolCallSnapshot>,
    broker: EventBroker,
    publishing: Mutex<()>,
    /// Fired once the call is cancelled
    cancelled: CancellationToken,
}

/// Shared handle to one tool call. Clones observe and mutate the same call.
#[derive(Clone)]
pub struct ToolCall {
    inner: Arc<ToolCallInner>,
}

impl std::fmt::Debug for ToolCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCall")
            .field("id", &self.inner.tool_use.id)
            .field("name", &self.inner.tool_use.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ToolCall {
    /// Create a call in `Pending` without announcing it
    pub fn new(tool_use: ToolUse, session_id: impl Into<String>, broker: EventBroker) -> Self {
        let (cell, _) = watch::channel(ToolCallSnapshot::pending());
        Self {
            inner: Arc::new(ToolCallInner {
                tool_use,
                session_id: session_id.into(),
                created_at: Utc::now(),
                cell,
                broker,
                publishing: Mutex::new(()),
                cancelled: CancellationToken::new(),
            }),
        }
    }

    /// Create a call and publish its creation
    pub async fn create(
        tool_use: ToolUse,
        session_id: impl Into<String>,
        broker: EventBroker,
    ) -> Self {
        let call = Self::new(tool_use, session_id, broker);
        call.publish_update(EventKind::Created, None, ToolCallState::Pending)
            .await;
        call
    }

    pub fn id(&self) -> &str {
        &self.inner.tool_use.id
    }

    pub fn name(&self) -> &str {
        &self.inner.tool_use.name
    }

    pub fn input(&self) -> &Value {
        &self.inner.tool_use.input
    }

    pub fn tool_use(&self) -> &ToolUse {
        &self.inner.tool_use
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> ToolCallState {
        self.inner.cell.borrow().state
    }

    pub fn snapshot(&self) -> ToolCallSnapshot {
        self.inner.cell.borrow().clone()
    }

    /// Ask an external approver. Only valid from `Pending`.
    pub async fn request_permission(&self) -> Result<(), TransitionError> {
        self.transition(ToolCallState::PermissionPending, |_| {})
            .await?;

        let request = PermissionRequest {
            session_id: self.inner.session_id.clone(),
            tool_call_id: self.id().to_string(),
            tool_name: self.name().to_string(),
            input: self.input().clone(),
        };
        self.inner
            .broker
            .publish(EventKind::Created, AgentEvent::PermissionRequested(request))
            .await;
        Ok(())
    }

    pub async fn approve(&self) -> Result<(), TransitionError> {
        self.transition(ToolCallState::PermissionApproved, |_| {})
            .await
    }

    pub async fn deny(&self) -> Result<(), TransitionError> {
        self.transition(ToolCallState::PermissionDenied, |snap| {
            snap.finished_at = Some(Utc::now());
        })
        .await
    }

    /// Begin execution. Valid from `Pending` (pre-approved) or `PermissionApproved`.
    pub async fn start(&self) -> Result<(), TransitionError> {
        self.transition(ToolCallState::Running, |snap| {
            snap.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn complete(&self, output: impl Into<String>) -> Result<(), TransitionError> {
        let output = output.into();
        self.transition(ToolCallState::Completed, move |snap| {
            snap.output = Some(output);
            snap.finished_at = Some(Utc::now());
        })
        .await
    }

    pub async fn fail(&self, error: impl Into<String>) -> Result<(), TransitionError> {
        let error = error.into();
        self.transition(ToolCallState::Failed, move |snap| {
            snap.error = Some(error);
            snap.finished_at = Some(Utc::now());
        })
        .await
    }

    /// Stop the call from any non-terminal state.
    ///
    /// Also fires the call's cancellation token, so a running executor
    /// holding a token from `cancelled()` sees it.
    pub async fn cancel(&self) -> Result<(), TransitionError> {
        self.transition(ToolCallState::Cancelled, |snap| {
            snap.finished_at = Some(Utc::now());
        })
        .await?;
        self.inner.cancelled.cancel();
        Ok(())
    }

    /// Resolves once `cancel()` has succeeded
    pub async fn cancelled(&self) {
        self.inner.cancelled.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.is_cancelled()
    }

    /// Wait until the call is no longer awaiting permission.
    ///
    /// Returns the state that ended the wait, or `None` if `cancel` fired
    /// first. Returns immediately when the call is not in `PermissionPending`.
    pub async fn wait_for_decision(&self, cancel: &CancellationToken) -> Option<ToolCallState> {
        let mut rx = self.inner.cell.subscribe();
        let decided = async move {
            rx.wait_for(|snap| snap.state != ToolCallState::PermissionPending)
                .await
                .map(|snap| snap.state)
                .ok()
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            state = decided => state,
        }
    }

    async fn transition<F>(&self, to: ToolCallState, apply: F) -> Result<(), TransitionError>
    where
        F: FnOnce(&mut ToolCallSnapshot),
    {
        let _order = self.inner.publishing.lock().await;
        let from = self.commit(to, apply)?;
        debug!(tool = %self.name(), id = %self.id(), %from, %to, "Tool call transition");
        if to.is_terminal() {
            info!(tool = %self.name(), id = %self.id(), state = %to, "Tool call finished");
        }
        self.publish_update(EventKind::Updated, Some(from), to)
            .await;
        Ok(())
    }

    /// Check and apply a transition atomically, returning the previous state
    fn commit<F>(&self, to: ToolCallState, apply: F) -> Result<ToolCallState, TransitionError>
    where
        F: FnOnce(&mut ToolCallSnapshot),
    {
        let mut outcome = None;
        self.inner.cell.send_if_modified(|snap| {
            let from = snap.state;
            if from.is_terminal() {
                outcome = Some(Err(TransitionError::AlreadyTerminal {
                    id: self.inner.tool_use.id.clone(),
                    state: from,
                }));
                return false;
            }
            if !from.can_transition_to(to) {
                outcome = Some(Err(TransitionError::Invalid {
                    id: self.inner.tool_use.id.clone(),
                    from,
                    to,
                }));
                return false;
            }
            snap.state = to;
            apply(snap);
            outcome = Some(Ok(from));
            true
        });

        match outcome {
            Some(result) => result,
            // send_if_modified always runs the closure
            None => Err(TransitionError::Invalid {
                id: self.inner.tool_use.id.clone(),
                from: self.state(),
                to,
            }),
        }
    }

    async fn publish_update(&self, kind: EventKind, from: Option<ToolCallState>, to: ToolCallState) {
        let update = ToolCallUpdate {
            session_id: self.inner.session_id.clone(),
            tool_call_id: self.id().to_string(),
            tool_name: self.name().to_string(),
            from,
            to,
            at: Utc::now(),
        };
        self.inner
            .broker
            .publish(kind, AgentEvent::ToolCallUpdated(update))
            .await;
    }
}
