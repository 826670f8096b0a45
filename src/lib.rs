// agent-core - Concurrency core for an AI coding assistant
// Library exports

pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod permission;
pub mod pubsub;
pub mod scheduler;
pub mod toolcall;
pub mod tools;

pub use agent::{AgentLoop, FinishReason, ProviderEvent, StopReason, TurnOutcome};
pub use errors::{AgentError, ProviderError, ToolError, TransitionError};
pub use events::{AgentEvent, EventBroker};
pub use pubsub::{Broker, BrokerOptions, Event, EventKind, Subscription};
pub use scheduler::{Scheduler, SchedulerConfig, TaskHandler, TaskResult, TaskStatus};
pub use toolcall::{ToolCall, ToolCallState};
pub use tools::{ToolExecutor, ToolResult, ToolUse};
