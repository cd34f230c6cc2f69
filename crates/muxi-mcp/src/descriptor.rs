// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use muxi_config::{McpServerConfig, McpTransport};

/// Lifecycle state of one MCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Ready => 2,
            ConnectionState::Degraded => 3,
            ConnectionState::Closed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Degraded,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Shared, lock-free observable connection state. Cloning shares the same
/// underlying atomic so the demultiplexer task, the service, and any caller
/// polling `list_tools`/`invoke` all see the same value without a lock.
#[derive(Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_u8())))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.get() == ConnectionState::Ready
    }
}

/// Transport-specific connection parameters, resolved from config.
#[derive(Debug, Clone)]
pub enum Transport {
    HttpSse {
        endpoint: String,
        credentials: Option<String>,
    },
    Command {
        command_line: Vec<String>,
        restart_on_exit: bool,
    },
}

/// Registration-time parameters for one MCP server. Connection state is
/// tracked separately via [`SharedState`] since it mutates after
/// registration.
#[derive(Debug, Clone)]
pub struct McpServerDescriptor {
    pub server_id: String,
    pub transport: Transport,
    pub request_timeout: std::time::Duration,
}

impl McpServerDescriptor {
    pub fn from_config(cfg: &McpServerConfig) -> anyhow::Result<Self> {
        let transport = match cfg.transport {
            McpTransport::HttpSse => Transport::HttpSse {
                endpoint: cfg
                    .endpoint
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("http_sse transport requires `endpoint`"))?,
                credentials: cfg.credentials.clone(),
            },
            McpTransport::Command => {
                if cfg.command_line.is_empty() {
                    anyhow::bail!("command transport requires a non-empty `command_line`");
                }
                Transport::Command {
                    command_line: cfg.command_line.clone(),
                    restart_on_exit: cfg.restart_on_exit,
                }
            }
        };
        Ok(Self {
            server_id: cfg.server_id.clone(),
            transport,
            request_timeout: std::time::Duration::from_secs(cfg.request_timeout_secs),
        })
    }
}
