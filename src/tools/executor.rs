// Tool execution seam
//
// The agent loop drives tool calls through `ToolExecutor`. Permission and
// lifecycle handling live in the loop; an executor only performs the work.

use crate::errors::ToolError;
use crate::tools::registry::ToolRegistry;
use crate::tools::types::ToolUse;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Performs the side effect of one tool use.
///
/// Errors are classified by the scheduler, so executors should surface the
/// underlying error (`ProviderError`, `std::io::Error`, ...) rather than a
/// flattened string where they can.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_use: &ToolUse, cancel: CancellationToken) -> Result<String>;
}

/// Executor that dispatches to tools registered by name
pub struct RegistryExecutor {
    registry: ToolRegistry,
}

impl RegistryExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolExecutor for RegistryExecutor {
    #[instrument(skip(self, tool_use, cancel), fields(tool = %tool_use.name, id = %tool_use.id))]
    async fn execute(&self, tool_use: &ToolUse, cancel: CancellationToken) -> Result<String> {
        let tool = self
            .registry
            .get(&tool_use.name)
            .ok_or_else(|| ToolError::NotFound(tool_use.name.clone()))?;

        if !tool_use.input.is_object() {
            return Err(ToolError::InvalidInput {
                tool: tool_use.name.clone(),
                reason: "input must be a JSON object".to_string(),
            }
            .into());
        }

        debug!("Executing tool: {}", tool_use.name);
        match tool.execute(tool_use.input.clone(), cancel).await {
            Ok(output) => {
                info!("Tool executed successfully");
                Ok(output)
            }
            Err(e) => {
                error!("Tool execution failed: {}", e);
                Err(e)
            }
        }
    }
}
