// Domain events published on the session broker

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::agent::FinishReason;
use crate::pubsub::Broker;
use crate::toolcall::ToolCallState;

/// Broker type shared by the agent loop and every tool call in a session
pub type EventBroker = Broker<AgentEvent>;

/// Everything a UI, logger or persistence mirror can observe about a session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant text grew; `text` is the full message so far.
    MessageUpdated { session_id: String, text: String },

    /// A tool call was created or changed state.
    ToolCallUpdated(ToolCallUpdate),

    /// A tool call is waiting on an external approver.
    PermissionRequested(PermissionRequest),

    /// The turn ended.
    TurnFinished {
        session_id: String,
        finish: FinishReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallUpdate {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    /// `None` when the call was just created
    pub from: Option<ToolCallState>,
    pub to: ToolCallState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

impl AgentEvent {
    /// Tool call this event concerns, if any
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            AgentEvent::ToolCallUpdated(update) => Some(&update.tool_call_id),
            AgentEvent::PermissionRequested(request) => Some(&request.tool_call_id),
            _ => None,
        }
    }
}
