// Presentation hints for tool call states
//
// Renderers pick glyphs and colors themselves; this only says which kind
// of treatment each state gets.

use serde::Serialize;

use super::state::ToolCallState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Animation {
    Static,
    /// Counts up while waiting on a person
    Timer,
    Pulse,
    Spinner,
    /// Brief flash on completion
    Blink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Neutral,
    Attention,
    Active,
    Success,
    Muted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayHint {
    pub icon: &'static str,
    /// Short label for copy/paste and plain logs
    pub label: &'static str,
    pub status_message: &'static str,
    pub animation: Animation,
    pub tone: Tone,
}

const ICON_PENDING: &str = "●";
const ICON_SUCCESS: &str = "✓";
const ICON_ERROR: &str = "×";
const ICON_CANCEL: &str = "○";

pub fn display_hint(state: ToolCallState) -> DisplayHint {
    match state {
        ToolCallState::Pending => DisplayHint {
            icon: ICON_PENDING,
            label: "Pending...",
            status_message: "Waiting for tool to start...",
            animation: Animation::Static,
            tone: Tone::Neutral,
        },
        ToolCallState::PermissionPending => DisplayHint {
            icon: ICON_PENDING,
            label: "Permissions...",
            status_message: "Awaiting permission...",
            animation: Animation::Timer,
            tone: Tone::Attention,
        },
        ToolCallState::PermissionApproved => DisplayHint {
            icon: ICON_SUCCESS,
            label: "Approved",
            status_message: "Permission approved. Executing command...",
            animation: Animation::Pulse,
            tone: Tone::Success,
        },
        ToolCallState::PermissionDenied => DisplayHint {
            icon: ICON_ERROR,
            label: "Denied",
            status_message: "Permission denied.",
            animation: Animation::Static,
            tone: Tone::Error,
        },
        ToolCallState::Running => DisplayHint {
            icon: ICON_PENDING,
            label: "Running...",
            status_message: "Running...",
            animation: Animation::Spinner,
            tone: Tone::Active,
        },
        ToolCallState::Completed => DisplayHint {
            icon: ICON_SUCCESS,
            label: "",
            status_message: "Done",
            animation: Animation::Blink,
            tone: Tone::Success,
        },
        ToolCallState::Failed => DisplayHint {
            icon: ICON_ERROR,
            label: "Failed",
            status_message: "Tool call failed.",
            animation: Animation::Static,
            tone: Tone::Error,
        },
        ToolCallState::Cancelled => DisplayHint {
            icon: ICON_CANCEL,
            label: "Cancelled",
            status_message: "Cancelled.",
            animation: Animation::Static,
            tone: Tone::Muted,
        },
    }
}
