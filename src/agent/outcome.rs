// Turn results

use serde::{Deserialize, Serialize};

use super::provider::StopReason;
use crate::tools::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// No tools requested; the assistant is done
    EndTurn,
    /// Tools ran; their results go back to the model
    ToolUse,
    /// At least one tool call was denied
    PermissionDenied,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: String,
    /// Full assistant text for the turn
    pub text: String,
    /// `None` when the turn was cancelled before the provider finished
    pub stop_reason: Option<StopReason>,
    /// One result per tool call, in the order the model requested them
    pub tool_results: Vec<ToolResult>,
    pub finish: FinishReason,
}

impl TurnOutcome {
    pub fn has_tool_errors(&self) -> bool {
        self.tool_results.iter().any(|r| r.is_error)
    }
}
