// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One MCP connection: handshake, reconnect-with-backoff, and request
//! correlation (spec §4.3, §6).

mod command;
mod http_sse;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::catalog::ServerCatalog;
use crate::descriptor::{ConnectionState, McpServerDescriptor, SharedState, Transport};
use crate::errors::McpError;
use crate::rpc::RpcResponse;
use muxi_tools::Tool;

/// Base backoff before the first reconnect attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(250);
/// Reconnect backoff ceiling (spec §3 "exponential backoff capped at a
/// configured maximum").
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// The write-half of a live connection. Guarded by a single mutex per
/// connection (spec §4.3 "a lock per connection for writes to the
/// write-half"); reads happen on an independent demultiplexer task.
pub(crate) enum WriteHalf {
    HttpSse {
        client: reqwest::Client,
        message_url: String,
        credentials: Option<String>,
    },
    Command {
        stdin: tokio::process::ChildStdin,
    },
}

impl WriteHalf {
    async fn send(&mut self, body: &str) -> Result<(), String> {
        match self {
            WriteHalf::HttpSse {
                client,
                message_url,
                credentials,
            } => {
                let mut req = client
                    .post(message_url.as_str())
                    .header("content-type", "application/json")
                    .body(body.to_string());
                if let Some(token) = credentials {
                    req = req.bearer_auth(token);
                }
                let resp = req.send().await.map_err(|e| e.to_string())?;
                if resp.status().as_u16() != 202 {
                    return Err(format!("expected 202 Accepted, got {}", resp.status()));
                }
                Ok(())
            }
            WriteHalf::Command { stdin } => {
                use tokio::io::AsyncWriteExt;
                stdin
                    .write_all(body.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                stdin.write_all(b"\n").await.map_err(|e| e.to_string())?;
                stdin.flush().await.map_err(|e| e.to_string())
            }
        }
    }
}

/// One MCP server connection, owned by the `McpService`.
pub struct Connection {
    pub descriptor: McpServerDescriptor,
    pub state: SharedState,
    pub catalog: ServerCatalog,
    write: Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
    pending: PendingMap,
    supervisor: JoinHandle<()>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Connection {
    /// Register and open a connection. Returns immediately; connection
    /// happens in the background (spec §4.1 "`chat` must not block on MCP
    /// reconnect").
    pub fn spawn(descriptor: McpServerDescriptor, catalog: ServerCatalog) -> Self {
        let state = SharedState::new(ConnectionState::Disconnected);
        let write: Arc<tokio::sync::Mutex<Option<WriteHalf>>> =
            Arc::new(tokio::sync::Mutex::new(None));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let supervisor = tokio::spawn(supervise(
            descriptor.clone(),
            state.clone(),
            catalog.clone(),
            write.clone(),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            descriptor,
            state,
            catalog,
            write,
            pending,
            supervisor,
            closed,
        }
    }

    /// Invoke one tool. Never blocks waiting for a reconnect — if the
    /// connection is not `Ready`, fails immediately with `ConnectionLost`.
    pub async fn invoke(
        &self,
        tool_name: &str,
        params: serde_json::Value,
        deadline: Duration,
        mut cancel: CancelToken,
    ) -> Result<serde_json::Value, McpError> {
        let server_id = self.descriptor.server_id.clone();

        // Cancel fired before send: produce Cancelled without a network send
        // (spec §8 round-trip law).
        if cancel.is_cancelled() {
            return Err(McpError::Cancelled {
                server_id,
                request_id: String::new(),
            });
        }

        if !self.state.is_ready() {
            return Err(McpError::ConnectionLost(server_id));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(request_id.clone(), tx);

        let frame = crate::rpc::RpcRequest::new(
            request_id.clone(),
            "tools/call",
            Some(serde_json::json!({ "name": tool_name, "arguments": params })),
        );
        let body = serde_json::to_string(&frame).map_err(|e| McpError::Transport {
            server_id: server_id.clone(),
            message: e.to_string(),
        })?;

        {
            let mut guard = self.write.lock().await;
            match guard.as_mut() {
                Some(half) => {
                    if let Err(e) = half.send(&body).await {
                        self.pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&request_id);
                        self.state.set(ConnectionState::Degraded);
                        return Err(McpError::Transport {
                            server_id,
                            message: e,
                        });
                    }
                }
                None => {
                    self.pending
                        .lock()
                        .expect("pending lock poisoned")
                        .remove(&request_id);
                    return Err(McpError::ConnectionLost(server_id));
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.pending.lock().expect("pending lock poisoned").remove(&request_id);
                Err(McpError::Cancelled { server_id, request_id })
            }
            _ = tokio::time::sleep(deadline) => {
                self.pending.lock().expect("pending lock poisoned").remove(&request_id);
                Err(McpError::Timeout { server_id, request_id })
            }
            result = rx => {
                match result {
                    Ok(resp) => {
                        if let Some(err) = resp.error {
                            Err(McpError::RpcError { server_id, message: err.message })
                        } else {
                            Ok(resp.result.unwrap_or(serde_json::Value::Null))
                        }
                    }
                    // Sender dropped without sending — happens when the
                    // connection-loss path drains pending slots directly.
                    Err(_) => Err(McpError::ConnectionLost(server_id)),
                }
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.supervisor.abort();
        self.state.set(ConnectionState::Closed);
        fail_all_pending(&self.pending);
    }
}

fn fail_all_pending(pending: &PendingMap) {
    let mut guard = pending.lock().expect("pending lock poisoned");
    for (_, tx) in guard.drain() {
        drop(tx); // dropped sender -> invoke()'s rx resolves to Err -> ConnectionLost
    }
}

/// Backoff delay for reconnect attempt `attempt` (0-indexed), jittered and
/// capped (spec §3, §4.3).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 4).max(1));
    capped + Duration::from_millis(jitter_ms)
}

async fn supervise(
    descriptor: McpServerDescriptor,
    state: SharedState,
    catalog: ServerCatalog,
    write: Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
    pending: PendingMap,
    closed: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut attempt = 0u32;
    loop {
        if closed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        state.set(ConnectionState::Connecting);

        let connect_result = match &descriptor.transport {
            Transport::HttpSse {
                endpoint,
                credentials,
            } => http_sse::connect(endpoint, credentials.clone(), pending.clone()).await,
            Transport::Command {
                command_line,
                restart_on_exit: _,
            } => command::connect(command_line, pending.clone()).await,
        };

        let (half, demux) = match connect_result {
            Ok(v) => v,
            Err(e) => {
                warn!(server_id = %descriptor.server_id, error = %e, attempt, "MCP connect failed");
                state.set(ConnectionState::Degraded);
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
                continue;
            }
        };

        *write.lock().await = Some(half);

        // Handshake: initialize, then discover tools.
        match handshake(&descriptor, &write, &pending).await {
            Ok(tools) => {
                catalog.set(tools);
                state.set(ConnectionState::Ready);
                attempt = 0;
                debug!(server_id = %descriptor.server_id, "MCP server ready");
            }
            Err(e) => {
                warn!(server_id = %descriptor.server_id, error = %e, "MCP handshake failed");
                *write.lock().await = None;
                state.set(ConnectionState::Degraded);
                fail_all_pending(&pending);
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
                continue;
            }
        }

        // Block until the demultiplexer task observes I/O failure or EOF.
        let _ = demux.await;

        if closed.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        warn!(server_id = %descriptor.server_id, "MCP connection lost; reconnecting");
        *write.lock().await = None;
        state.set(ConnectionState::Degraded);
        fail_all_pending(&pending);
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt += 1;
    }
}

/// Send `initialize` then `tools/list` over the just-opened connection and
/// wait for their correlated responses, using the same pending-map
/// correlation path as `invoke`.
async fn handshake(
    descriptor: &McpServerDescriptor,
    write: &Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
    pending: &PendingMap,
) -> anyhow::Result<Vec<Tool>> {
    let timeout = descriptor.request_timeout;

    send_and_wait(write, pending, "initialize", serde_json::json!({}), timeout).await?;

    let result = send_and_wait(
        write,
        pending,
        "tools/list",
        serde_json::json!({}),
        timeout,
    )
    .await?;

    let tools = result
        .get("tools")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(tools
        .into_iter()
        .filter_map(|t| {
            let name = t.get("name")?.as_str()?.to_string();
            let description = t
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let parameter_schema = t
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object"}));
            Some(Tool {
                server_id: descriptor.server_id.clone(),
                name,
                parameter_schema,
                description,
            })
        })
        .collect())
}

async fn send_and_wait(
    write: &Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
    pending: &PendingMap,
    method: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> anyhow::Result<serde_json::Value> {
    let request_id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    pending
        .lock()
        .expect("pending lock poisoned")
        .insert(request_id.clone(), tx);

    let frame = crate::rpc::RpcRequest::new(request_id.clone(), method, Some(params));
    let body = serde_json::to_string(&frame)?;

    {
        let mut guard = write.lock().await;
        let half = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("connection not writable"))?;
        half.send(&body)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let resp = tokio::time::timeout(timeout, rx)
        .await
        .map_err(|_| anyhow::anyhow!("{method} timed out"))?
        .map_err(|_| anyhow::anyhow!("connection closed while awaiting {method}"))?;

    if let Some(err) = resp.error {
        anyhow::bail!("{method} returned error: {}", err.message);
    }
    Ok(resp.result.unwrap_or(serde_json::Value::Null))
}

pub(crate) fn deliver(pending: &PendingMap, resp: RpcResponse) {
    let Some(id) = resp.id.clone() else { return };
    let sender = pending.lock().expect("pending lock poisoned").remove(&id);
    if let Some(tx) = sender {
        let _ = tx.send(resp);
    }
    // A late response with no matching slot (already timed out/cancelled)
    // is silently dropped, per spec §4.3 "if a late response ever arrives,
    // drop it".
}
