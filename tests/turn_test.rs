// Integration tests for a full agent turn
//
// Wires config loading, the tool registry, the agent loop and a broker
// subscriber together the way an embedding CLI would.

use agent_core::agent::{AgentLoop, FinishReason, ProviderEvent, StopReason};
use agent_core::config::load_config_from;
use agent_core::errors::ProviderError;
use agent_core::events::AgentEvent;
use agent_core::toolcall::ToolCallState;
use agent_core::tools::{RegistryExecutor, Tool, ToolRegistry};
use anyhow::Result;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file"
    }

    async fn execute(&self, input: Value, _cancel: CancellationToken) -> Result<String> {
        let path = input["file_path"].as_str().unwrap_or("<none>");
        Ok(format!("contents of {}", path))
    }
}

/// Fails with a 503 until it has been called `failures` times
struct FlakyTool {
    calls: AtomicUsize,
    failures: usize,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL"
    }

    async fn execute(&self, _input: Value, _cancel: CancellationToken) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ProviderError::with_status(503, "upstream unavailable").into());
        }
        Ok("fetched".to_string())
    }
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn build_agent(config_toml: &str, flaky_failures: usize) -> (Arc<AgentLoop>, Arc<FlakyTool>) {
    let file = write_config(config_toml);
    let config = load_config_from(file.path()).unwrap();

    let flaky = Arc::new(FlakyTool {
        calls: AtomicUsize::new(0),
        failures: flaky_failures,
    });
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadTool));
    registry.register(flaky.clone());

    let agent = AgentLoop::from_config(&config, Arc::new(RegistryExecutor::new(registry)));
    (Arc::new(agent), flaky)
}

const FAST_RETRIES: &str = r#"
[scheduler]
max_concurrent = 2
max_attempts = 3
base_delay_ms = 5
max_delay_ms = 20

[permissions]
allowed_tools = ["read", "fetch"]
"#;

fn turn(tools: &[(&str, &str, &str)]) -> Vec<ProviderEvent> {
    let mut events = vec![ProviderEvent::text("Working on it.")];
    for (id, name, input) in tools {
        events.extend(ProviderEvent::tool_use(id, name, input));
    }
    events.push(ProviderEvent::Complete {
        stop_reason: StopReason::ToolUse,
    });
    events
}

// ── Execution through the registry ─────────────────────────────────────────────

#[tokio::test]
async fn test_allowed_tools_run_from_config() {
    let (agent, _) = build_agent(FAST_RETRIES, 0);
    let cancel = CancellationToken::new();

    let events = turn(&[
        ("toolu_1", "read", r#"{"file_path": "src/lib.rs"}"#),
        ("toolu_2", "fetch", "{}"),
    ]);
    let outcome = agent
        .run_turn("session", stream::iter(events), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.finish, FinishReason::ToolUse);
    assert_eq!(outcome.tool_results[0].content, "contents of src/lib.rs");
    assert_eq!(outcome.tool_results[1].content, "fetched");
    assert!(!outcome.has_tool_errors());
}

#[tokio::test]
async fn test_transient_tool_failure_is_retried() {
    let (agent, flaky) = build_agent(FAST_RETRIES, 2);
    let cancel = CancellationToken::new();

    let outcome = agent
        .run_turn("session", stream::iter(turn(&[("toolu_1", "fetch", "{}")])), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.tool_results[0].content, "fetched");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_call() {
    let (agent, flaky) = build_agent(FAST_RETRIES, 10);
    let cancel = CancellationToken::new();

    let outcome = agent
        .run_turn("session", stream::iter(turn(&[("toolu_1", "fetch", "{}")])), &cancel)
        .await
        .unwrap();

    assert!(outcome.tool_results[0].is_error);
    assert!(outcome.tool_results[0].content.contains("503"));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unknown_tool_is_not_retried() {
    let (agent, _) = build_agent(&format!("{}skip = true\n", FAST_RETRIES), 0);
    let cancel = CancellationToken::new();
    let cancel_sub = CancellationToken::new();
    let sub = agent.broker().subscribe(&cancel_sub);

    let outcome = agent
        .run_turn("session", stream::iter(turn(&[("toolu_1", "write", "{}")])), &cancel)
        .await
        .unwrap();
    assert!(outcome.tool_results[0].content.contains("not found"));

    // Pending, Running, Failed: one attempt only
    cancel_sub.cancel();
    let transitions: Vec<ToolCallState> = sub
        .filter_map(|event| async move {
            match event.payload {
                AgentEvent::ToolCallUpdated(update) => Some(update.to),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(
        transitions,
        vec![
            ToolCallState::Pending,
            ToolCallState::Running,
            ToolCallState::Failed
        ]
    );
}

// ── Approval ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancelling_one_call_keeps_the_rest() {
    let (agent, _) = build_agent(
        r#"
[permissions]
allowed_tools = ["read"]
"#,
        0,
    );

    // fetch needs approval; cancel it instead of answering
    let watcher_cancel = CancellationToken::new();
    let mut sub = agent.broker().subscribe(&watcher_cancel);
    let canceller = {
        let agent = agent.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if let AgentEvent::PermissionRequested(request) = event.payload {
                    agent.cancel_tool_call(&request.tool_call_id).await.unwrap();
                }
            }
        })
    };

    let events = turn(&[
        ("toolu_1", "fetch", "{}"),
        ("toolu_2", "read", r#"{"file_path": "Cargo.toml"}"#),
    ]);
    let outcome = agent
        .run_turn("session", stream::iter(events), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.finish, FinishReason::ToolUse);
    assert_eq!(
        outcome.tool_results[0].content,
        "Tool execution canceled by user"
    );
    assert_eq!(outcome.tool_results[1].content, "contents of Cargo.toml");

    watcher_cancel.cancel();
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_turn_finished_published_last() {
    let (agent, _) = build_agent(FAST_RETRIES, 0);
    let cancel_sub = CancellationToken::new();
    let sub = agent.broker().subscribe(&cancel_sub);

    let events = vec![
        ProviderEvent::text("done"),
        ProviderEvent::Complete {
            stop_reason: StopReason::EndTurn,
        },
    ];
    agent
        .run_turn("session", stream::iter(events), &CancellationToken::new())
        .await
        .unwrap();

    cancel_sub.cancel();
    let received: Vec<AgentEvent> = sub.map(|event| event.payload).collect().await;
    assert_eq!(received.len(), 2);
    assert!(matches!(received[0], AgentEvent::MessageUpdated { .. }));
    assert!(matches!(
        received[1],
        AgentEvent::TurnFinished {
            finish: FinishReason::EndTurn,
            ..
        }
    ));
}
