// Tool use types and the execution seam
//
// The core never decides what a tool does; it hands a `ToolUse` to a
// `ToolExecutor` once the call is allowed to run.

pub mod executor;
pub mod registry;
pub mod types;

pub use executor::{RegistryExecutor, ToolExecutor};
pub use registry::{Tool, ToolRegistry};
pub use types::{ToolResult, ToolUse};
