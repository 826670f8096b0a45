// Provider stream events
//
// The normalized shape every LLM client adapter produces. Tool use input
// arrives as partial JSON fragments between start and stop.

use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// Why the provider stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Assistant text
    ContentDelta(String),
    ToolUseStart { id: String, name: String },
    /// A fragment of the tool input JSON
    ToolUseDelta { id: String, partial_json: String },
    ToolUseStop { id: String },
    Complete { stop_reason: StopReason },
    Error(ProviderError),
}

impl ProviderEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        ProviderEvent::ContentDelta(delta.into())
    }

    /// Start, one delta carrying the whole input, and stop for a tool use
    pub fn tool_use(id: &str, name: &str, input_json: &str) -> Vec<Self> {
        vec![
            ProviderEvent::ToolUseStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            ProviderEvent::ToolUseDelta {
                id: id.to_string(),
                partial_json: input_json.to_string(),
            },
            ProviderEvent::ToolUseStop { id: id.to_string() },
        ]
    }
}
