// Tool use wire types
//
// Compatible with the Anthropic tool use format

use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ID_SUFFIX_LEN: usize = 24;

/// Tool use request assembled from the provider stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    /// `toolu_` followed by 24 alphanumerics unless the provider assigned one
    pub id: String,
    pub name: String,
    /// Always a JSON object once it reaches a tool
    pub input: Value,
}

impl ToolUse {
    pub fn generate_id() -> String {
        let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), ID_SUFFIX_LEN);
        format!("toolu_{suffix}")
    }

    /// Tool use with a freshly generated id
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self::with_id(Self::generate_id(), name, input)
    }

    /// Keep a provider-assigned id
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Result sent back to the model for one tool use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    /// Tool output, or the error text when `is_error` is set
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_use_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::build(tool_use_id.into(), output.into(), false)
    }

    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(tool_use_id.into(), message.into(), true)
    }

    fn build(tool_use_id: String, content: String, is_error: bool) -> Self {
        Self {
            tool_use_id,
            content,
            is_error,
        }
    }
}
