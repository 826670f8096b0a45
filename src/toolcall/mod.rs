// Tool call lifecycle
//
// `ToolCall` is the shared handle the agent loop, the approver and the
// executing worker all hold. Transitions are validated against `ToolCallState`
// and published on the session broker.

mod call;
mod display;
mod state;

pub use call::{ToolCall, ToolCallSnapshot};
pub use display::{display_hint, Animation, DisplayHint, Tone};
pub use state::{should_show_content, ToolCallState};
