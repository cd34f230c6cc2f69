// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors surfaced by the MCP Service.
///
/// `ConnectionLost` and a `Timeout` against a still-ready server are
/// transient and worth one retry by the caller; everything else here is
/// recoverable-by-the-model (fed back as a `tool` message) rather than fatal
/// to the turn.
#[derive(Debug, Error, Clone)]
pub enum McpError {
    #[error("server {0} is already registered")]
    AlreadyRegistered(String),
    #[error("no MCP server registered with id {0}")]
    UnknownServer(String),
    #[error("tool {tool_name} not found on server {server_id}")]
    ToolNotFound { server_id: String, tool_name: String },
    /// The catalog was refreshed (reconnect) after the caller resolved this
    /// tool reference.
    #[error("tool {tool_name} is no longer offered by server {server_id}")]
    ToolGone { server_id: String, tool_name: String },
    #[error("request {request_id} to server {server_id} timed out")]
    Timeout { server_id: String, request_id: String },
    #[error("request {request_id} to server {server_id} was cancelled")]
    Cancelled { server_id: String, request_id: String },
    #[error("connection to server {0} was lost")]
    ConnectionLost(String),
    #[error("transport error talking to server {server_id}: {message}")]
    Transport { server_id: String, message: String },
    #[error("server {server_id} returned a JSON-RPC error: {message}")]
    RpcError { server_id: String, message: String },
}

impl McpError {
    /// Whether a caller may reasonably retry this error against the same
    /// server once.
    pub fn retryable(&self) -> bool {
        matches!(self, McpError::ConnectionLost(_) | McpError::Timeout { .. })
    }
}
