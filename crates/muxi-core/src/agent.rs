// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Turn Pipeline's state machine (spec §3 Turn lifecycle: `routing
//! [caller] → composing → model_streaming → [tool_dispatch →
//! model_streaming]* → finalizing → extracting [detached, caller]`).
//! `routing` selects the agent before `run_turn` is ever called, and
//! `extracting` is the caller's business after a successful `chat()` — this
//! module only owns `composing` through `finalizing`.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use muxi_mcp::{CancelToken, McpService};
use muxi_memory::{BufferMemory, LongTermStore, Memobase, Metadata};
use muxi_model::{
    CompletionRequest, FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, Role,
    ToolSchema,
};
use muxi_tools::ToolOutput;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::compose::{self, ComposeInputs};
use crate::descriptor::AgentDescriptor;
use crate::errors::TurnError;
use crate::events::TurnEvent;

/// What a turn needs to know about its request (spec §6 `chat` parameters).
pub struct TurnInput<'a> {
    pub message: &'a str,
    /// `0` denotes anonymous — buffer-only, no Memobase/Long-Term writes.
    pub user_id: u64,
    pub conversation_id: Option<&'a str>,
}

/// Every subsystem a turn touches, borrowed for the call's duration
/// (spec §5: "Agents are otherwise stateless across turns").
pub struct TurnDeps<'a> {
    pub model: &'a dyn ModelProvider,
    pub mcp: &'a McpService,
    pub buffer: &'a BufferMemory,
    pub long_term: Option<&'a dyn LongTermStore>,
    pub memobase: &'a Memobase,
}

/// Tunables from spec §5 "Timeouts" plus the retrieval-size knobs `compose`
/// needs. Cloned cheaply into each turn; the Orchestrator resolves these
/// once from `Config` and reuses the same value for every call.
#[derive(Debug, Clone, Copy)]
pub struct TurnLimits {
    /// "Model per-chunk timeout (configurable, default 30s since last
    /// chunk)".
    pub model_chunk_timeout: Duration,
    /// "Per tool invocation deadline (agent or global default 60s)" — used
    /// when `AgentDescriptor::request_timeout_override` is `None`.
    pub tool_invocation_timeout: Duration,
    /// "Whole-turn deadline (optional)".
    pub whole_turn_deadline: Option<Duration>,
    /// Interval `stream_sink` must accept a chunk within before the turn
    /// aborts with `ConsumerSlow` (spec §5 "Backpressure").
    pub consumer_timeout: Duration,
    pub buffer_limit: usize,
    pub long_term_limit: usize,
    pub knowledge_top_k: usize,
    pub knowledge_threshold: f32,
    /// Importance assigned to the assistant reply when it is written to
    /// Long-Term Memory (spec §4.5 leaves the value to the implementer).
    pub reply_importance: f32,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            model_chunk_timeout: Duration::from_secs(30),
            tool_invocation_timeout: Duration::from_secs(60),
            whole_turn_deadline: None,
            consumer_timeout: Duration::from_secs(5),
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
            reply_importance: 0.5,
        }
    }
}

/// What a successful turn returns to its caller (spec §6 `chat` response
/// envelope, minus the streamed body which already went to `stream_sink`).
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub tool_rounds: u32,
    pub trace_id: String,
}

/// Run one turn to completion. `stream_sink` receives every [`TurnEvent`] in
/// model-emission order; the function also returns the final outcome for
/// callers that only need the whole reply plus its bookkeeping fields.
pub async fn run_turn(
    agent: &AgentDescriptor,
    deps: TurnDeps<'_>,
    input: TurnInput<'_>,
    stream_sink: mpsc::Sender<TurnEvent>,
    cancel: CancelToken,
    limits: TurnLimits,
) -> Result<TurnOutcome, TurnError> {
    let trace_id = Uuid::new_v4().to_string();
    let body = run_turn_body(agent, &deps, &input, &stream_sink, cancel, limits);
    let result = match limits.whole_turn_deadline {
        Some(deadline) => match tokio::time::timeout(deadline, body).await {
            Ok(result) => result,
            Err(_) => Err(TurnError::ModelStalled { elapsed_secs: deadline.as_secs() }),
        },
        None => body.await,
    };

    finalize(agent, &deps, &input, &result, &trace_id, limits).await;

    match result {
        Ok((reply, tool_rounds)) => {
            let _ = send_event(
                &stream_sink,
                TurnEvent::Done { tool_rounds, trace_id: trace_id.clone() },
                limits.consumer_timeout,
            )
            .await;
            Ok(TurnOutcome { reply, tool_rounds, trace_id })
        }
        Err(e) => {
            if !matches!(e, TurnError::Cancelled) {
                let _ = send_event(
                    &stream_sink,
                    TurnEvent::Error { kind: e.kind().to_string(), message: e.to_string() },
                    limits.consumer_timeout,
                )
                .await;
            }
            Err(e)
        }
    }
}

/// `composing` through the tool-dispatch loop. Returns the final reply text
/// and the number of tool-call rounds taken.
async fn run_turn_body(
    agent: &AgentDescriptor,
    deps: &TurnDeps<'_>,
    input: &TurnInput<'_>,
    stream_sink: &mpsc::Sender<TurnEvent>,
    mut cancel: CancelToken,
    limits: TurnLimits,
) -> Result<(String, u32), TurnError> {
    let ready = deps.mcp.ready_server_ids();
    if let Some(server_id) = agent.missing_mandatory_servers(&ready).into_iter().next() {
        return Err(TurnError::ToolUnavailable { server_id });
    }

    let query_embedding = embed_one(deps.model, input.message).await;
    let mut messages = compose::compose(ComposeInputs {
        agent,
        buffer: deps.buffer,
        long_term: deps.long_term,
        memobase: deps.memobase,
        user_id: input.user_id,
        conversation_id: input.conversation_id,
        message: input.message,
        query_embedding: query_embedding.as_deref(),
        buffer_limit: limits.buffer_limit,
        long_term_limit: limits.long_term_limit,
        knowledge_top_k: limits.knowledge_top_k,
        knowledge_threshold: limits.knowledge_threshold,
    })
    .await;

    let mut tool_rounds: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let ready = deps.mcp.ready_server_ids();
        let (tools, owners) = tool_schemas(deps.mcp, agent, &ready);

        let mut stream = deps
            .model
            .complete(CompletionRequest { messages: messages.clone(), tools, stream: true, ..Default::default() })
            .await
            .map_err(|e| TurnError::ModelFailed(e.to_string()))?;

        let mut round_text = String::new();
        let mut calls: Vec<(usize, String, String, String)> = Vec::new();

        'chunks: loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                chunk = tokio::time::timeout(limits.model_chunk_timeout, stream.next()) => {
                    let chunk = chunk.map_err(|_| TurnError::ModelStalled { elapsed_secs: limits.model_chunk_timeout.as_secs() })?;
                    match chunk {
                        None | Some(Ok(ResponseEvent::Done)) => break 'chunks,
                        Some(Err(e)) => return Err(TurnError::ModelFailed(e.to_string())),
                        Some(Ok(ResponseEvent::Error(message))) => return Err(TurnError::ModelFailed(message)),
                        Some(Ok(ResponseEvent::TextDelta(text))) => {
                            round_text.push_str(&text);
                            send_event(stream_sink, TurnEvent::Token(text), limits.consumer_timeout)
                                .await
                                .map_err(|_| TurnError::ConsumerSlow)?;
                        }
                        Some(Ok(ResponseEvent::ToolCall { index, id, name, arguments })) => {
                            match calls.iter_mut().find(|(i, ..)| *i == index) {
                                Some(entry) => entry.3.push_str(&arguments),
                                None => calls.push((index, id, name, arguments)),
                            }
                        }
                        Some(Ok(ResponseEvent::ThinkingDelta(_))) | Some(Ok(ResponseEvent::Usage { .. })) => {}
                    }
                }
            }
        }

        if calls.is_empty() {
            return Ok((round_text, tool_rounds));
        }

        tool_rounds += 1;
        if tool_rounds > agent.max_tool_rounds {
            return Err(TurnError::ToolLoopExceeded { max_rounds: agent.max_tool_rounds });
        }

        if !round_text.is_empty() {
            messages.push(Message::assistant(round_text));
        }
        calls.sort_by_key(|(index, ..)| *index);
        for (_, id, name, arguments) in &calls {
            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::ToolCall {
                    tool_call_id: id.clone(),
                    function: FunctionCall { name: name.clone(), arguments: arguments.clone() },
                },
            });
            send_event(
                stream_sink,
                TurnEvent::ToolCallStart { id: id.clone(), name: name.clone() },
                limits.consumer_timeout,
            )
            .await
            .map_err(|_| TurnError::ConsumerSlow)?;
        }

        let deadline = agent.request_timeout_override.unwrap_or(limits.tool_invocation_timeout);
        let outputs = dispatch_round(deps.mcp, &owners, calls, deadline, &cancel).await;
        for output in outputs {
            send_event(
                stream_sink,
                TurnEvent::ToolCallResult { id: output.call_id.clone(), is_error: output.is_error },
                limits.consumer_timeout,
            )
            .await
            .map_err(|_| TurnError::ConsumerSlow)?;
            messages.push(Message::tool_result(output.call_id, output.content.to_string()));
        }
    }
}

/// Dispatch one round of tool calls concurrently (spec §5 "Each turn may
/// spawn parallel tool invocations within one tool-call round"). A call
/// whose name matches no ready server's tool fails locally without ever
/// reaching `McpService::invoke`.
///
/// `mcp` is borrowed rather than an owned `Arc`, so these run as
/// concurrently polled futures on the current task instead of
/// `tokio::spawn`ed ones — `tokio::spawn` requires `'static` and would force
/// every caller of `run_turn` to hand over ownership of its `McpService`.
/// Concurrency is the same; only a panic in one dispatch can no longer be
/// isolated from the others.
async fn dispatch_round(
    mcp: &McpService,
    owners: &HashMap<String, String>,
    calls: Vec<(usize, String, String, String)>,
    deadline: Duration,
    cancel: &CancelToken,
) -> Vec<ToolOutput> {
    let dispatches = calls.into_iter().map(|(_, id, name, arguments)| {
        let cancel = cancel.clone();
        async move {
            match owners.get(&name).cloned() {
                None => ToolOutput::err(id, format!("tool `{name}` is not offered by any ready server")),
                Some(server_id) => {
                    let params = serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null);
                    match mcp.invoke(&server_id, &name, params, deadline, cancel).await {
                        Ok(value) => ToolOutput::ok(id, value.to_string()),
                        Err(e) => ToolOutput::err(id, e.to_string()),
                    }
                }
            }
        }
    });
    futures::future::join_all(dispatches).await
}

/// Tool schemas visible to the model this round, plus a `name -> server_id`
/// lookup for dispatch (spec §4.1 "an agent's registered tool scope is a
/// subset of currently-ready MCP servers").
fn tool_schemas(
    mcp: &McpService,
    agent: &AgentDescriptor,
    ready: &std::collections::HashSet<String>,
) -> (Vec<ToolSchema>, HashMap<String, String>) {
    let mut schemas = Vec::new();
    let mut owners = HashMap::new();
    for server_id in agent.ready_tool_scope(ready) {
        for tool in mcp.list_tools(Some(server_id)) {
            owners.entry(tool.name.clone()).or_insert_with(|| server_id.to_string());
            schemas.push(ToolSchema { name: tool.name, description: tool.description, parameters: tool.parameter_schema });
        }
    }
    (schemas, owners)
}

async fn embed_one(model: &dyn ModelProvider, text: &str) -> Option<Vec<f32>> {
    model.embed(&[text.to_string()]).await.ok().and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
}

/// Push to `stream_sink` with the backpressure deadline from spec §5: block
/// while the consumer is merely slow, abort once it exceeds the configured
/// interval.
async fn send_event(sink: &mpsc::Sender<TurnEvent>, event: TurnEvent, timeout: Duration) -> Result<(), ()> {
    tokio::time::timeout(timeout, sink.send(event)).await.map_err(|_| ()).and_then(|r| r.map_err(|_| ()))
}

/// `finalizing` (spec §5 cancellation: "updates the buffer with the user
/// message only" on failure/cancel; success additionally stores the
/// assistant reply and, for known users, a Long-Term record).
async fn finalize(
    agent: &AgentDescriptor,
    deps: &TurnDeps<'_>,
    input: &TurnInput<'_>,
    result: &Result<(String, u32), TurnError>,
    trace_id: &str,
    limits: TurnLimits,
) {
    // Anonymous turns are excluded from persistence entirely (spec §3
    // "user_id = 0 records are never produced").
    if input.user_id == 0 {
        return;
    }

    let mut metadata = Metadata::new(input.user_id).with_agent(agent.agent_id.clone());
    if let Some(conversation_id) = input.conversation_id {
        metadata = metadata.with_conversation(conversation_id.to_string());
    }
    let user_embedding = embed_one(deps.model, input.message).await;
    deps.buffer.add(input.message.to_string(), metadata.clone(), user_embedding);

    if let Ok((reply, _)) = result {
        let reply_embedding = embed_one(deps.model, reply).await;
        deps.buffer.add(reply.clone(), metadata, reply_embedding.clone());

        if let (Some(store), Some(embedding)) = (deps.long_term, reply_embedding) {
            if let Err(e) = store
                .add(reply.clone(), embedding, serde_json::Value::Null, limits.reply_importance, input.user_id, None)
                .await
            {
                tracing::warn!(error = %e, trace_id, "long-term memory write failed for assistant reply");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use muxi_config::VectorMetric;
    use muxi_memory::SqliteLongTermStore;
    use muxi_model::{MockProvider, ScriptedMockProvider};

    use super::*;

    fn agent() -> AgentDescriptor {
        AgentDescriptor {
            agent_id: "assistant".into(),
            name: "Assistant".into(),
            description: "general purpose".into(),
            system_prompt: "You are a helpful assistant.".into(),
            model_handle: None,
            knowledge: Vec::new(),
            tool_scope: Default::default(),
            mandatory_tools: Default::default(),
            recency_bias: 0.3,
            request_timeout_override: None,
            max_tool_rounds: 6,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn simple_turn_streams_tokens_and_completes() {
        let model = MockProvider;
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: None, memobase: &memobase };
        let (tx, rx) = mpsc::channel(16);

        let outcome = run_turn(
            &agent(),
            deps,
            TurnInput { message: "hello", user_id: 1, conversation_id: None },
            tx,
            CancelToken::never(),
            TurnLimits::default(),
        )
        .await
        .unwrap();

        assert!(outcome.reply.contains("MOCK: hello"));
        assert_eq!(outcome.tool_rounds, 0);
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        assert_eq!(buffer.len(), 2); // user message + assistant reply
    }

    #[tokio::test]
    async fn missing_mandatory_tool_fails_before_any_model_call() {
        let model = ScriptedMockProvider::always_text("should never run");
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let mut descriptor = agent();
        descriptor.mandatory_tools.insert("weather".to_string());
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: None, memobase: &memobase };
        let (tx, _rx) = mpsc::channel(16);

        let err = run_turn(
            &descriptor,
            deps,
            TurnInput { message: "hi", user_id: 1, conversation_id: None },
            tx,
            CancelToken::never(),
            TurnLimits::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TurnError::ToolUnavailable { server_id } if server_id == "weather"));
        assert!(model.last_request.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn tool_loop_exceeding_max_rounds_fails_and_buffers_only_the_user_message() {
        // The scripted provider always returns a fresh tool call, so the
        // round counter climbs past `max_tool_rounds` without ever replying.
        let model = ScriptedMockProvider::new(vec![vec![
            ResponseEvent::ToolCall { index: 0, id: "call-1".into(), name: "shell".into(), arguments: "{}".into() },
            ResponseEvent::Done,
        ]]);
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let mut descriptor = agent();
        descriptor.max_tool_rounds = 1;
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: None, memobase: &memobase };
        let (tx, _rx) = mpsc::channel(16);

        let err = run_turn(
            &descriptor,
            deps,
            TurnInput { message: "loop", user_id: 3, conversation_id: None },
            tx,
            CancelToken::never(),
            TurnLimits::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TurnError::ToolLoopExceeded { max_rounds: 1 }));
        assert_eq!(buffer.len(), 1); // user message only, no assistant reply
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_the_model_entirely() {
        let model = ScriptedMockProvider::always_text("should never run");
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: None, memobase: &memobase };
        let (tx, _rx) = mpsc::channel(16);
        let (handle, token) = muxi_mcp::CancelHandle::new();
        handle.cancel();

        let err = run_turn(
            &agent(),
            deps,
            TurnInput { message: "hi", user_id: 1, conversation_id: None },
            tx,
            token,
            TurnLimits::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TurnError::Cancelled));
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn anonymous_turn_writes_nothing_to_buffer() {
        let model = MockProvider;
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: None, memobase: &memobase };
        let (tx, _rx) = mpsc::channel(16);

        run_turn(
            &agent(),
            deps,
            TurnInput { message: "hi", user_id: 0, conversation_id: None },
            tx,
            CancelToken::never(),
            TurnLimits::default(),
        )
        .await
        .unwrap();

        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn successful_turn_without_embeddings_skips_long_term_write() {
        let model = MockProvider; // MockProvider has no embed() override, so it errors.
        let mcp = McpService::new();
        let buffer = BufferMemory::new(32_000, 4, 64, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let store = SqliteLongTermStore::open_in_memory(8).unwrap();
        let deps = TurnDeps { model: &model, mcp: &mcp, buffer: &buffer, long_term: Some(&store), memobase: &memobase };
        let (tx, _rx) = mpsc::channel(16);

        run_turn(
            &agent(),
            deps,
            TurnInput { message: "hi", user_id: 9, conversation_id: None },
            tx,
            CancelToken::never(),
            TurnLimits::default(),
        )
        .await
        .unwrap();

        let hits = store
            .search(&[0.0; 8], 10, muxi_memory::LongTermFilter { user_id: Some(9), agent_id: None })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
