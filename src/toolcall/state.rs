// Tool call lifecycle states
//
// Permission gating and execution tracking share one closed enum, so
// combinations such as "denied but running" cannot be represented.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    /// Created from a tool use block, not yet started
    Pending,
    /// Waiting for an approver
    PermissionPending,
    /// Approved, about to run
    PermissionApproved,
    /// Approver said no
    PermissionDenied,
    /// Executing
    Running,
    Completed,
    Failed,
    /// Stopped before finishing
    Cancelled,
}

impl ToolCallState {
    pub const ALL: [ToolCallState; 8] = [
        ToolCallState::Pending,
        ToolCallState::PermissionPending,
        ToolCallState::PermissionApproved,
        ToolCallState::PermissionDenied,
        ToolCallState::Running,
        ToolCallState::Completed,
        ToolCallState::Failed,
        ToolCallState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Completed
                | ToolCallState::Failed
                | ToolCallState::Cancelled
                | ToolCallState::PermissionDenied
        )
    }

    /// States reachable in one step
    pub fn successors(self) -> &'static [ToolCallState] {
        use ToolCallState::*;
        match self {
            Pending => &[PermissionPending, Running, Cancelled],
            PermissionPending => &[PermissionApproved, PermissionDenied, Cancelled],
            PermissionApproved => &[Running, Cancelled],
            Running => &[Completed, Failed, Cancelled],
            PermissionDenied | Completed | Failed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: ToolCallState) -> bool {
        self.successors().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolCallState::Pending => "pending",
            ToolCallState::PermissionPending => "permission_pending",
            ToolCallState::PermissionApproved => "permission_approved",
            ToolCallState::PermissionDenied => "permission_denied",
            ToolCallState::Running => "running",
            ToolCallState::Completed => "completed",
            ToolCallState::Failed => "failed",
            ToolCallState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a tool's content (input details, output) should be shown yet.
///
/// Nothing is shown before the call runs or while it awaits approval, and a
/// denied call never shows content.
pub fn should_show_content(state: ToolCallState) -> bool {
    match state {
        ToolCallState::Pending
        | ToolCallState::PermissionPending
        | ToolCallState::PermissionDenied => false,
        ToolCallState::PermissionApproved
        | ToolCallState::Running
        | ToolCallState::Completed
        | ToolCallState::Failed
        | ToolCallState::Cancelled => true,
    }
}
