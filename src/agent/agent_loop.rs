// Turn coordination
//
// Consumes one provider stream, turns tool use blocks into ToolCalls, gates
// them on the permission policy, and runs them as one scheduler batch. Calls
// join the batch as their permission decisions arrive.

use dashmap::DashMap;
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::outcome::{FinishReason, TurnOutcome};
use super::provider::{ProviderEvent, StopReason};
use super::tool_task::{ToolCallTask, ToolOutcome};
use crate::config::Config;
use crate::errors::AgentError;
use crate::events::{AgentEvent, EventBroker};
use crate::permission::{AllowListPolicy, PermissionPolicy};
use crate::pubsub::{Broker, EventKind};
use crate::scheduler::{Scheduler, TaskResult, TaskStatus};
use crate::toolcall::{ToolCall, ToolCallState};
use crate::tools::{ToolExecutor, ToolResult, ToolUse};

const PERMISSION_DENIED: &str = "Permission denied";
const TOOL_CANCELLED: &str = "Tool execution canceled by user";

/// Tool use block being assembled from stream deltas
struct PartialToolUse {
    name: String,
    json: String,
}

enum StreamEnd {
    Completed { stop_reason: StopReason, text: String },
    Cancelled { text: String },
}

/// Drives agent turns against one session broker
pub struct AgentLoop {
    broker: EventBroker,
    scheduler: Scheduler,
    policy: Arc<dyn PermissionPolicy>,
    executor: Arc<dyn ToolExecutor>,
    /// Tool calls of turns in progress, by id
    active: DashMap<String, ToolCall>,
}

impl AgentLoop {
    pub fn new(
        broker: EventBroker,
        scheduler: Scheduler,
        policy: Arc<dyn PermissionPolicy>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            broker,
            scheduler,
            policy,
            executor,
            active: DashMap::new(),
        }
    }

    /// Build the broker, scheduler and allow-list policy from settings
    pub fn from_config(config: &Config, executor: Arc<dyn ToolExecutor>) -> Self {
        Self::new(
            Broker::with_options(config.broker.to_options()),
            Scheduler::new(config.scheduler.to_scheduler_config()),
            Arc::new(AllowListPolicy::from_config(&config.permissions)),
            executor,
        )
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Look up a tool call of a turn in progress
    pub fn tool_call(&self, id: &str) -> Option<ToolCall> {
        self.active.get(id).map(|entry| entry.value().clone())
    }

    pub fn active_tool_calls(&self) -> Vec<ToolCall> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn approve(&self, id: &str) -> Result<(), AgentError> {
        let call = self.require(id)?;
        call.approve().await?;
        info!(tool = %call.name(), id, "Tool call approved");
        Ok(())
    }

    /// Approve, and let later calls of the same tool in this session skip the prompt
    pub async fn approve_for_session(&self, id: &str) -> Result<(), AgentError> {
        let call = self.require(id)?;
        call.approve().await?;
        self.policy.remember(call.name(), call.session_id());
        info!(tool = %call.name(), id, "Tool call approved for session");
        Ok(())
    }

    pub async fn deny(&self, id: &str) -> Result<(), AgentError> {
        let call = self.require(id)?;
        call.deny().await?;
        info!(tool = %call.name(), id, "Tool call denied");
        Ok(())
    }

    /// Cancel one tool call without stopping the rest of the turn
    pub async fn cancel_tool_call(&self, id: &str) -> Result<(), AgentError> {
        self.require(id)?.cancel().await?;
        Ok(())
    }

    fn require(&self, id: &str) -> Result<ToolCall, AgentError> {
        self.tool_call(id)
            .ok_or_else(|| AgentError::UnknownToolCall { id: id.to_string() })
    }

    /// Run one assistant turn to completion.
    ///
    /// Returns once the stream completed and every requested tool call is
    /// terminal, or as soon as `cancel` fires. A provider error or a
    /// malformed tool use cancels the tool calls created so far and is
    /// returned as an error.
    #[instrument(skip(self, stream, cancel), fields(session = %session_id))]
    pub async fn run_turn<S>(
        &self,
        session_id: &str,
        stream: S,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError>
    where
        S: Stream<Item = ProviderEvent>,
    {
        info!("Turn started");
        let mut calls: Vec<ToolCall> = Vec::new();

        let outcome = match self.drive(session_id, stream, cancel, &mut calls).await {
            Ok(StreamEnd::Completed { stop_reason, text }) => {
                debug!(?stop_reason, tools = calls.len(), "Provider stream complete");
                Ok(self
                    .run_tools(session_id, text, Some(stop_reason), &calls, cancel)
                    .await)
            }
            Ok(StreamEnd::Cancelled { text }) => {
                info!("Turn cancelled while streaming");
                let mut tool_results = Vec::with_capacity(calls.len());
                for call in &calls {
                    tool_results.push(self.settle_cancelled(call).await);
                }
                Ok(TurnOutcome {
                    session_id: session_id.to_string(),
                    text,
                    stop_reason: None,
                    tool_results,
                    finish: FinishReason::Cancelled,
                })
            }
            Err(err) => {
                warn!("Turn failed: {}", err);
                for call in &calls {
                    if let Err(err) = call.cancel().await {
                        debug!("Tool call settled elsewhere: {}", err);
                    }
                }
                Err(err)
            }
        };

        for call in &calls {
            self.active.remove(call.id());
        }

        if let Ok(outcome) = &outcome {
            info!(finish = ?outcome.finish, tools = outcome.tool_results.len(), "Turn finished");
            self.broker
                .publish(
                    EventKind::Created,
                    AgentEvent::TurnFinished {
                        session_id: session_id.to_string(),
                        finish: outcome.finish,
                    },
                )
                .await;
        }
        outcome
    }

    async fn drive<S>(
        &self,
        session_id: &str,
        stream: S,
        cancel: &CancellationToken,
        calls: &mut Vec<ToolCall>,
    ) -> Result<StreamEnd, AgentError>
    where
        S: Stream<Item = ProviderEvent>,
    {
        tokio::pin!(stream);
        let mut text = String::new();
        let mut partial: HashMap<String, PartialToolUse> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled { text }),
                event = stream.next() => event,
            };

            match event.ok_or(AgentError::StreamEnded)? {
                ProviderEvent::ContentDelta(delta) => {
                    text.push_str(&delta);
                    self.broker
                        .publish(
                            EventKind::Updated,
                            AgentEvent::MessageUpdated {
                                session_id: session_id.to_string(),
                                text: text.clone(),
                            },
                        )
                        .await;
                }
                ProviderEvent::ToolUseStart { id, name } => {
                    debug!(tool = %name, %id, "Tool use block started");
                    let fresh = PartialToolUse {
                        name,
                        json: String::new(),
                    };
                    if partial.insert(id.clone(), fresh).is_some() {
                        return Err(AgentError::MalformedToolUse {
                            id,
                            reason: "started twice".to_string(),
                        });
                    }
                }
                ProviderEvent::ToolUseDelta { id, partial_json } => match partial.get_mut(&id) {
                    Some(tool_use) => tool_use.json.push_str(&partial_json),
                    None => {
                        return Err(AgentError::MalformedToolUse {
                            id,
                            reason: "input delta before start".to_string(),
                        })
                    }
                },
                ProviderEvent::ToolUseStop { id } => {
                    let Some(tool_use) = partial.remove(&id) else {
                        return Err(AgentError::MalformedToolUse {
                            id,
                            reason: "stop without start".to_string(),
                        });
                    };
                    let input = parse_input(&id, &tool_use.json)?;
                    let call = self
                        .register(session_id, ToolUse::with_id(id, tool_use.name, input))
                        .await?;
                    calls.push(call);
                }
                ProviderEvent::Complete { stop_reason } => {
                    if let Some(id) = partial.keys().next() {
                        return Err(AgentError::MalformedToolUse {
                            id: id.clone(),
                            reason: "stream completed before tool use stopped".to_string(),
                        });
                    }
                    return Ok(StreamEnd::Completed { stop_reason, text });
                }
                ProviderEvent::Error(err) => return Err(AgentError::Provider(err)),
            }
        }
    }

    /// Create the call, make it reachable by id, and ask for permission unless pre-approved
    async fn register(&self, session_id: &str, tool_use: ToolUse) -> Result<ToolCall, AgentError> {
        let call = ToolCall::create(tool_use, session_id, self.broker.clone()).await;
        self.active.insert(call.id().to_string(), call.clone());
        info!(tool = %call.name(), id = %call.id(), "Tool call created");

        if self.policy.is_pre_approved(call.name(), session_id) {
            debug!(tool = %call.name(), id = %call.id(), "Tool call pre-approved");
        } else {
            call.request_permission().await?;
        }
        Ok(call)
    }

    async fn run_tools(
        &self,
        session_id: &str,
        text: String,
        stop_reason: Option<StopReason>,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let mut tool_results = Vec::with_capacity(calls.len());
        let mut denied = false;

        if !calls.is_empty() {
            // A call takes a worker only once it is decided, so prompts
            // left unanswered never starve pre-approved calls
            let ready = stream::iter(calls.iter().cloned().enumerate())
                .map(|(index, call)| async move {
                    if call.state() == ToolCallState::PermissionPending {
                        debug!(id = %call.id(), "Waiting for permission decision");
                        call.wait_for_decision(cancel).await;
                    }
                    (index, call)
                })
                .buffer_unordered(calls.len());

            let handler = Arc::new(ToolCallTask::new(self.executor.clone()));
            let results = self
                .scheduler
                .execute_ready(cancel, calls.len(), ready, handler)
                .await;

            for (call, result) in calls.iter().zip(results) {
                tool_results.push(self.settle(call, result).await);
                denied |= call.state() == ToolCallState::PermissionDenied;
            }
        }

        let finish = if cancel.is_cancelled() {
            FinishReason::Cancelled
        } else if denied {
            FinishReason::PermissionDenied
        } else if calls.is_empty() {
            FinishReason::EndTurn
        } else {
            FinishReason::ToolUse
        };

        TurnOutcome {
            session_id: session_id.to_string(),
            text,
            stop_reason,
            tool_results,
            finish,
        }
    }

    /// Bring a call to a terminal state matching its task result
    async fn settle(&self, call: &ToolCall, result: TaskResult<ToolOutcome>) -> ToolResult {
        let id = call.id().to_string();
        match result.status {
            TaskStatus::Succeeded => match result.output {
                Some(ToolOutcome::Completed(output)) => ToolResult::success(id, output),
                Some(ToolOutcome::Denied) => ToolResult::error(id, PERMISSION_DENIED),
                Some(ToolOutcome::Cancelled) | None => ToolResult::error(id, TOOL_CANCELLED),
            },
            TaskStatus::Failed => {
                let message = result
                    .error
                    .map(|failure| failure.message)
                    .unwrap_or_else(|| "Tool execution failed".to_string());
                let settled = if call.state() == ToolCallState::Running {
                    call.fail(message.clone()).await
                } else {
                    call.cancel().await
                };
                if let Err(err) = settled {
                    debug!("Tool call settled elsewhere: {}", err);
                }
                ToolResult::error(id, message)
            }
            TaskStatus::Cancelled | TaskStatus::Queued | TaskStatus::Running => {
                self.settle_cancelled(call).await
            }
        }
    }

    async fn settle_cancelled(&self, call: &ToolCall) -> ToolResult {
        if let Err(err) = call.cancel().await {
            debug!("Tool call settled elsewhere: {}", err);
        }
        let message = if call.state() == ToolCallState::PermissionDenied {
            PERMISSION_DENIED
        } else {
            TOOL_CANCELLED
        };
        ToolResult::error(call.id(), message)
    }
}

fn parse_input(id: &str, json: &str) -> Result<Value, AgentError> {
    if json.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(json).map_err(|e| AgentError::MalformedToolUse {
        id: id.to_string(),
        reason: format!("invalid input JSON: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ProviderError, ToolError};
    use crate::pubsub::Subscription;
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct EchoExecutor {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(
            &self,
            tool_use: &ToolUse,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} ran with {}", tool_use.name, tool_use.input))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl ToolExecutor for FailingExecutor {
        async fn execute(
            &self,
            tool_use: &ToolUse,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            Err(ToolError::NotFound(tool_use.name.clone()).into())
        }
    }

    /// Waits on its token for a long time; records whether it was told to stop
    #[derive(Default)]
    struct SlowExecutor {
        token: parking_lot::Mutex<Option<CancellationToken>>,
        finished: AtomicBool,
    }

    #[async_trait]
    impl ToolExecutor for SlowExecutor {
        async fn execute(
            &self,
            _tool_use: &ToolUse,
            cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            *self.token.lock() = Some(cancel.clone());
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("interrupted"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    self.finished.store(true, Ordering::SeqCst);
                    Ok("slept".to_string())
                }
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl ToolExecutor for PanickingExecutor {
        async fn execute(
            &self,
            tool_use: &ToolUse,
            _cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            panic!("{} crashed", tool_use.name)
        }
    }

    fn make_agent(policy: AllowListPolicy, executor: Arc<dyn ToolExecutor>) -> Arc<AgentLoop> {
        let scheduler = Scheduler::new(
            SchedulerConfig::default()
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20)),
        );
        Arc::new(AgentLoop::new(
            Broker::new(),
            scheduler,
            Arc::new(policy),
            executor,
        ))
    }

    fn allow_all() -> AllowListPolicy {
        let policy = AllowListPolicy::new();
        policy.set_skip(true);
        policy
    }

    fn tool_turn(tools: &[(&str, &str, &str)]) -> Vec<ProviderEvent> {
        let mut events = vec![ProviderEvent::text("Let me check.")];
        for (id, name, input) in tools {
            events.extend(ProviderEvent::tool_use(id, name, input));
        }
        events.push(ProviderEvent::Complete {
            stop_reason: StopReason::ToolUse,
        });
        events
    }

    /// Approve or deny every permission request seen on the broker
    fn spawn_approver(agent: Arc<AgentLoop>, approve: bool) -> tokio::task::JoinHandle<()> {
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);
        tokio::spawn(async move {
            let _keep = cancel;
            while let Some(event) = sub.recv().await {
                if let AgentEvent::PermissionRequested(request) = event.payload {
                    let result = if approve {
                        agent.approve(&request.tool_call_id).await
                    } else {
                        agent.deny(&request.tool_call_id).await
                    };
                    result.unwrap();
                }
            }
        })
    }

    fn drain(sub: &mut Subscription<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = sub.try_recv() {
            events.push(event.payload);
        }
        events
    }

    #[tokio::test]
    async fn test_text_only_turn() {
        let agent = make_agent(allow_all(), Arc::new(EchoExecutor::default()));
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let events = vec![
            ProviderEvent::text("Hello"),
            ProviderEvent::text(", world"),
            ProviderEvent::Complete {
                stop_reason: StopReason::EndTurn,
            },
        ];
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello, world");
        assert_eq!(outcome.finish, FinishReason::EndTurn);
        assert_eq!(outcome.stop_reason, Some(StopReason::EndTurn));
        assert!(outcome.tool_results.is_empty());

        let published = drain(&mut sub);
        let texts: Vec<&str> = published
            .iter()
            .filter_map(|e| match e {
                AgentEvent::MessageUpdated { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hello", "Hello, world"]);
        assert!(matches!(
            published.last(),
            Some(AgentEvent::TurnFinished {
                finish: FinishReason::EndTurn,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_pre_approved_tools_run() {
        let executor = Arc::new(EchoExecutor::default());
        let agent = make_agent(allow_all(), executor.clone());
        let cancel = CancellationToken::new();

        let events = tool_turn(&[
            ("toolu_a", "read", r#"{"file_path": "a.rs"}"#),
            ("toolu_b", "grep", ""),
        ]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert_eq!(outcome.tool_results.len(), 2);
        assert_eq!(outcome.tool_results[0].tool_use_id, "toolu_a");
        assert!(outcome.tool_results[0].content.contains("a.rs"));
        assert_eq!(outcome.tool_results[1].content, "grep ran with {}");
        assert!(!outcome.has_tool_errors());
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        assert!(agent.active_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_approved_tool_runs_after_permission() {
        let executor = Arc::new(EchoExecutor::default());
        let agent = make_agent(AllowListPolicy::new(), executor.clone());
        let approver = spawn_approver(agent.clone(), true);
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let events = tool_turn(&[("toolu_a", "bash", r#"{"command": "ls"}"#)]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert!(!outcome.tool_results[0].is_error);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);

        let states: Vec<ToolCallState> = drain(&mut sub)
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCallUpdated(update) => Some(update.to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ToolCallState::Pending,
                ToolCallState::PermissionPending,
                ToolCallState::PermissionApproved,
                ToolCallState::Running,
                ToolCallState::Completed,
            ]
        );
        approver.abort();
    }

    #[tokio::test]
    async fn test_denied_tool_never_runs() {
        let executor = Arc::new(EchoExecutor::default());
        let agent = make_agent(AllowListPolicy::new(), executor.clone());
        let approver = spawn_approver(agent.clone(), false);
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let events = tool_turn(&[("toolu_a", "bash", r#"{"command": "rm -rf /"}"#)]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::PermissionDenied);
        assert_eq!(outcome.tool_results[0].content, "Permission denied");
        assert!(outcome.tool_results[0].is_error);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
        assert!(drain(&mut sub).iter().all(|e| !matches!(
            e,
            AgentEvent::ToolCallUpdated(update) if update.to == ToolCallState::Running
        )));
        approver.abort();
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_permission() {
        let agent = make_agent(AllowListPolicy::new(), Arc::new(EchoExecutor::default()));
        let cancel = CancellationToken::new();

        let watcher_cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&watcher_cancel);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                if matches!(event.payload, AgentEvent::PermissionRequested(_)) {
                    trigger.cancel();
                }
            }
        });

        let events = tool_turn(&[("toolu_a", "bash", "{}")]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::Cancelled);
        assert_eq!(
            outcome.tool_results[0].content,
            "Tool execution canceled by user"
        );
        watcher_cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_while_streaming() {
        let agent = make_agent(allow_all(), Arc::new(EchoExecutor::default()));
        let cancel = CancellationToken::new();

        let mut events = vec![ProviderEvent::text("partial")];
        events.extend(ProviderEvent::tool_use("toolu_a", "read", "{}"));
        let never_ends = stream::iter(events).chain(stream::pending::<ProviderEvent>());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = agent.run_turn("s1", never_ends, &cancel).await.unwrap();
        assert_eq!(outcome.finish, FinishReason::Cancelled);
        assert_eq!(outcome.text, "partial");
        assert_eq!(outcome.stop_reason, None);
        assert_eq!(outcome.tool_results.len(), 1);
        assert!(outcome.tool_results[0].is_error);
        assert!(agent.tool_call("toolu_a").is_none());
    }

    #[tokio::test]
    async fn test_provider_error_cancels_created_calls() {
        let agent = make_agent(AllowListPolicy::new(), Arc::new(EchoExecutor::default()));
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let mut events = ProviderEvent::tool_use("toolu_a", "bash", "{}");
        events.push(ProviderEvent::Error(ProviderError::with_status(529, "overloaded")));

        let err = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Provider(ref e) if e.status == Some(529)));

        let last_state = drain(&mut sub)
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCallUpdated(update) => Some(update.to),
                _ => None,
            })
            .last();
        assert_eq!(last_state, Some(ToolCallState::Cancelled));
    }

    #[tokio::test]
    async fn test_malformed_tool_input() {
        let agent = make_agent(allow_all(), Arc::new(EchoExecutor::default()));
        let events = tool_turn(&[("toolu_a", "read", "{\"file_path\": ")]);

        let err = agent
            .run_turn("s1", stream::iter(events), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MalformedToolUse { ref id, .. } if id == "toolu_a"));
    }

    #[tokio::test]
    async fn test_stream_ending_early_is_an_error() {
        let agent = make_agent(allow_all(), Arc::new(EchoExecutor::default()));
        let events = vec![ProviderEvent::text("cut off")];

        let err = agent
            .run_turn("s1", stream::iter(events), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StreamEnded));
    }

    #[tokio::test]
    async fn test_fatal_tool_error_fails_call() {
        let agent = make_agent(allow_all(), Arc::new(FailingExecutor));
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let events = tool_turn(&[("toolu_a", "nonexistent", "{}")]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert!(outcome.tool_results[0].is_error);
        assert!(outcome.tool_results[0].content.contains("not found"));

        let failed = drain(&mut sub).into_iter().any(|e| {
            matches!(e, AgentEvent::ToolCallUpdated(update) if update.to == ToolCallState::Failed)
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_approve_unknown_tool_call() {
        let agent = make_agent(AllowListPolicy::new(), Arc::new(EchoExecutor::default()));
        let err = agent.approve("toolu_missing").await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownToolCall { .. }));
    }

    #[tokio::test]
    async fn test_approve_for_session_skips_later_prompts() {
        let policy = Arc::new(AllowListPolicy::new());
        let executor = Arc::new(EchoExecutor::default());
        let agent = Arc::new(AgentLoop::new(
            Broker::new(),
            Scheduler::default(),
            policy.clone(),
            executor.clone(),
        ));

        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);
        let approver = {
            let agent = agent.clone();
            tokio::spawn(async move {
                while let Some(event) = sub.recv().await {
                    if let AgentEvent::PermissionRequested(request) = event.payload {
                        agent
                            .approve_for_session(&request.tool_call_id)
                            .await
                            .unwrap();
                    }
                }
            })
        };

        let first = tool_turn(&[("toolu_a", "edit", "{}")]);
        agent
            .run_turn("s1", stream::iter(first), &cancel)
            .await
            .unwrap();
        assert!(policy.is_pre_approved("edit", "s1"));
        assert!(!policy.is_pre_approved("edit", "s2"));

        approver.abort();
        let second = tool_turn(&[("toolu_b", "edit", "{}")]);
        let outcome = agent
            .run_turn("s1", stream::iter(second), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_call_reaches_executor() {
        let executor = Arc::new(SlowExecutor::default());
        let agent = make_agent(allow_all(), executor.clone());

        let watcher_cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&watcher_cancel);
        let canceller = {
            let agent = agent.clone();
            tokio::spawn(async move {
                while let Some(event) = sub.recv().await {
                    if let AgentEvent::ToolCallUpdated(update) = event.payload {
                        if update.to == ToolCallState::Running {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            agent.cancel_tool_call(&update.tool_call_id).await.unwrap();
                            return;
                        }
                    }
                }
            })
        };

        let events = tool_turn(&[("toolu_a", "sleep", "{}")]);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run_turn("s1", stream::iter(events), &CancellationToken::new()),
        )
        .await
        .expect("cancelling the call should end the turn")
        .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert_eq!(outcome.tool_results[0].content, TOOL_CANCELLED);
        let token = executor.token.lock().clone().unwrap();
        assert!(token.is_cancelled());
        assert!(!executor.finished.load(Ordering::SeqCst));

        canceller.await.unwrap();
        watcher_cancel.cancel();
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_call() {
        let agent = make_agent(allow_all(), Arc::new(PanickingExecutor));
        let cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&cancel);

        let events = tool_turn(&[("toolu_a", "explode", "{}"), ("toolu_b", "explode", "{}")]);
        let outcome = agent
            .run_turn("s1", stream::iter(events), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        for result in &outcome.tool_results {
            assert!(result.is_error);
            assert!(result.content.contains("explode crashed"));
        }

        let failed = drain(&mut sub)
            .into_iter()
            .filter(|e| {
                matches!(e, AgentEvent::ToolCallUpdated(update) if update.to == ToolCallState::Failed)
            })
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_unanswered_prompts_do_not_block_approved_calls() {
        let policy = AllowListPolicy::new();
        policy.allow_tool("read");
        let executor = Arc::new(EchoExecutor::default());
        let agent = Arc::new(AgentLoop::new(
            Broker::new(),
            Scheduler::new(SchedulerConfig::default().with_max_concurrent(3)),
            Arc::new(policy),
            executor.clone(),
        ));

        // Approve the prompts only after the pre-approved call has completed
        let watcher_cancel = CancellationToken::new();
        let mut sub = agent.broker().subscribe(&watcher_cancel);
        let approver = {
            let agent = agent.clone();
            tokio::spawn(async move {
                let mut pending = Vec::new();
                while let Some(event) = sub.recv().await {
                    match event.payload {
                        AgentEvent::PermissionRequested(request) => {
                            pending.push(request.tool_call_id)
                        }
                        AgentEvent::ToolCallUpdated(update)
                            if update.tool_call_id == "toolu_4"
                                && update.to == ToolCallState::Completed =>
                        {
                            assert_eq!(pending.len(), 3);
                            for id in &pending {
                                agent.approve(id).await.unwrap();
                            }
                            return;
                        }
                        _ => {}
                    }
                }
            })
        };

        let events = tool_turn(&[
            ("toolu_1", "bash", "{}"),
            ("toolu_2", "bash", "{}"),
            ("toolu_3", "bash", "{}"),
            ("toolu_4", "read", "{}"),
        ]);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run_turn("s1", stream::iter(events), &CancellationToken::new()),
        )
        .await
        .expect("pre-approved call should not wait behind prompts")
        .unwrap();

        assert_eq!(outcome.finish, FinishReason::ToolUse);
        assert!(!outcome.has_tool_errors());
        assert_eq!(executor.runs.load(Ordering::SeqCst), 4);

        approver.await.unwrap();
        watcher_cancel.cancel();
    }
}
