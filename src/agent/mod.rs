// Agent loop
//
// Coordinates one assistant turn: streamed provider events in, tool calls
// gated on permission, scheduled execution, and every change published on
// the session broker.

mod agent_loop;
mod outcome;
mod provider;
mod tool_task;

pub use agent_loop::AgentLoop;
pub use outcome::{FinishReason, TurnOutcome};
pub use provider::{ProviderEvent, StopReason};
pub use tool_task::ToolOutcome;
