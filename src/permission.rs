// Permission policy for tool execution
//
// Decides whether a tool call may skip the approval step. Anything not
// pre-approved goes through `ToolCall::request_permission` and waits for a
// person.

use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::config::PermissionsConfig;

/// Fast-path approval check consulted once per tool call
pub trait PermissionPolicy: Send + Sync {
    fn is_pre_approved(&self, tool_name: &str, session_id: &str) -> bool;

    /// Remember an approval so later calls of the same tool in the session
    /// skip the prompt. No-op unless the policy caches grants.
    fn remember(&self, _tool_name: &str, _session_id: &str) {}
}

/// Allow-list policy with per-session auto approval
#[derive(Debug, Default)]
pub struct AllowListPolicy {
    allowed_tools: DashSet<String>,
    auto_approve_sessions: DashSet<String>,
    /// (session_id, tool_name) pairs granted persistently
    granted: DashSet<(String, String)>,
    skip: AtomicBool,
}

impl AllowListPolicy {
    /// Policy that asks for everything
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PermissionsConfig) -> Self {
        let policy = Self::new();
        for tool in &config.allowed_tools {
            policy.allow_tool(tool);
        }
        for session in &config.auto_approve_sessions {
            policy.auto_approve_session(session);
        }
        policy.set_skip(config.skip);
        policy
    }

    /// Approve a tool for every session
    pub fn allow_tool(&self, tool_name: &str) {
        self.allowed_tools.insert(tool_name.to_string());
    }

    /// Approve every tool in one session
    pub fn auto_approve_session(&self, session_id: &str) {
        self.auto_approve_sessions.insert(session_id.to_string());
    }

    /// Bypass approval entirely
    pub fn set_skip(&self, skip: bool) {
        self.skip.store(skip, Ordering::Relaxed);
    }

    pub fn is_skipping(&self) -> bool {
        self.skip.load(Ordering::Relaxed)
    }
}

impl PermissionPolicy for AllowListPolicy {
    fn is_pre_approved(&self, tool_name: &str, session_id: &str) -> bool {
        if self.is_skipping() {
            return true;
        }
        if self.allowed_tools.contains(tool_name) {
            return true;
        }
        if self.auto_approve_sessions.contains(session_id) {
            return true;
        }
        self.granted
            .contains(&(session_id.to_string(), tool_name.to_string()))
    }

    fn remember(&self, tool_name: &str, session_id: &str) {
        debug!(tool = tool_name, session = session_id, "Caching tool approval");
        self.granted
            .insert((session_id.to_string(), tool_name.to_string()));
    }
}
