// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The MCP Service (spec §4.3): a single, process-wide owner of every MCP
//! server connection, reachable through `register`/`invoke`/`list_tools`/
//! `close`/`close_all`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use muxi_config::McpServerConfig;
use muxi_tools::Tool;

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::connection::Connection;
use crate::descriptor::{ConnectionState, McpServerDescriptor};
use crate::errors::McpError;

/// Process-wide MCP connection manager. Cheap to clone: an `Arc` internally
/// would be redundant since callers are expected to hold one instance behind
/// their own `Arc` (mirrors how the Orchestrator holds its subsystems).
#[derive(Default)]
pub struct McpService {
    connections: RwLock<HashMap<String, Connection>>,
    catalog: Catalog,
}

impl McpService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and begin connecting to a new MCP server. Returns
    /// `AlreadyRegistered` if `server_id` is already registered rather than
    /// replacing it (spec open question: re-registration is an explicit
    /// `remove` + `register`, never an implicit overwrite).
    pub fn register(&self, cfg: &McpServerConfig) -> Result<(), McpError> {
        let descriptor = McpServerDescriptor::from_config(cfg)
            .map_err(|e| McpError::Transport { server_id: cfg.server_id.clone(), message: e.to_string() })?;

        let mut guard = self.connections.write().expect("mcp connections lock poisoned");
        if guard.contains_key(&descriptor.server_id) {
            return Err(McpError::AlreadyRegistered(descriptor.server_id));
        }
        let server_catalog = self.catalog.ensure_server(&descriptor.server_id);
        let connection = Connection::spawn(descriptor.clone(), server_catalog);
        guard.insert(descriptor.server_id.clone(), connection);
        Ok(())
    }

    /// Invoke one tool on one server. Looks the tool up in the catalog first
    /// so a stale reference (server reconnected with a different tool set)
    /// fails fast with `ToolGone` instead of reaching the wire.
    ///
    /// A `Timeout` against a server still observed `Ready` afterwards is
    /// retried once locally before being surfaced (spec §7 "one retry, then
    /// surface"); `ConnectionLost`/`Cancelled` are not retried — those
    /// already reflect the connection-level outcome.
    pub async fn invoke(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        deadline: Duration,
        cancel: CancelToken,
    ) -> Result<serde_json::Value, McpError> {
        if self.catalog.find(server_id, tool_name).is_none() {
            if self.catalog.list(Some(server_id)).is_empty() && !self.is_registered(server_id) {
                return Err(McpError::UnknownServer(server_id.to_string()));
            }
            return Err(McpError::ToolNotFound {
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
            });
        }

        let result = self
            .invoke_once(server_id, tool_name, params.clone(), deadline, cancel.clone())
            .await;

        if matches!(result, Err(McpError::Timeout { .. }))
            && self.connection_state(server_id) == Some(ConnectionState::Ready)
        {
            return self.invoke_once(server_id, tool_name, params, deadline, cancel).await;
        }

        result
    }

    async fn invoke_once(
        &self,
        server_id: &str,
        tool_name: &str,
        params: serde_json::Value,
        deadline: Duration,
        cancel: CancelToken,
    ) -> Result<serde_json::Value, McpError> {
        let guard = self.connections.read().expect("mcp connections lock poisoned");
        let connection = guard
            .get(server_id)
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;
        connection.invoke(tool_name, params, deadline, cancel).await
    }

    /// All tools currently known, optionally scoped to one server.
    pub fn list_tools(&self, server_id: Option<&str>) -> Vec<Tool> {
        self.catalog.list(server_id)
    }

    pub fn connection_state(&self, server_id: &str) -> Option<ConnectionState> {
        let guard = self.connections.read().expect("mcp connections lock poisoned");
        guard.get(server_id).map(|c| c.state.get())
    }

    /// Server ids currently in the `Ready` state (spec §4.1 "an agent's
    /// registered tool scope is a subset of currently-ready MCP servers").
    /// The Turn Pipeline consults this on every dispatch rather than caching
    /// it, so a server leaving `ready` mid-turn is observed immediately.
    pub fn ready_server_ids(&self) -> std::collections::HashSet<String> {
        let guard = self.connections.read().expect("mcp connections lock poisoned");
        guard
            .iter()
            .filter(|(_, c)| c.state.get() == ConnectionState::Ready)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_registered(&self, server_id: &str) -> bool {
        self.connections
            .read()
            .expect("mcp connections lock poisoned")
            .contains_key(server_id)
    }

    /// Disconnect and deregister one server. No-op if unknown.
    pub fn close(&self, server_id: &str) {
        let mut guard = self.connections.write().expect("mcp connections lock poisoned");
        if let Some(connection) = guard.remove(server_id) {
            connection.close();
        }
        self.catalog.remove_server(server_id);
    }

    /// Disconnect and deregister every server (process shutdown).
    pub fn close_all(&self) {
        let mut guard = self.connections.write().expect("mcp connections lock poisoned");
        for (_, connection) in guard.drain() {
            connection.close();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use muxi_config::McpTransport;

    fn cfg(server_id: &str) -> McpServerConfig {
        McpServerConfig {
            server_id: server_id.to_string(),
            transport: McpTransport::Command,
            endpoint: None,
            command_line: vec!["true".to_string()],
            credentials: None,
            request_timeout_secs: 5,
            restart_on_exit: true,
        }
    }

    #[tokio::test]
    async fn register_twice_with_same_id_is_rejected() {
        let service = McpService::new();
        service.register(&cfg("weather")).unwrap();
        let err = service.register(&cfg("weather")).unwrap_err();
        assert!(matches!(err, McpError::AlreadyRegistered(id) if id == "weather"));
    }

    #[tokio::test]
    async fn invoke_unknown_server_is_unknown_server_error() {
        let service = McpService::new();
        let err = service
            .invoke("nope", "tool", serde_json::json!({}), Duration::from_millis(10), CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(id) if id == "nope"));
    }

    #[tokio::test]
    async fn close_removes_server_from_catalog_and_registry() {
        let service = McpService::new();
        service.register(&cfg("weather")).unwrap();
        service.close("weather");
        assert!(service.list_tools(Some("weather")).is_empty());
        assert!(!service.is_registered("weather"));
    }

    #[tokio::test]
    async fn list_tools_empty_before_handshake_completes() {
        let service = McpService::new();
        service.register(&cfg("weather")).unwrap();
        assert!(service.list_tools(None).is_empty());
    }

    #[tokio::test]
    async fn ready_server_ids_excludes_unregistered_servers() {
        let service = McpService::new();
        assert!(service.ready_server_ids().is_empty());
        service.register(&cfg("weather")).unwrap();
        // A command transport pointed at `true` exits immediately and never
        // reaches `ready`, so it must not appear in the ready set.
        assert!(!service.ready_server_ids().contains("weather"));
    }
}
