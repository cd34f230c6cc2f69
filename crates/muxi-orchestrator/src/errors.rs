// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Orchestrator error taxonomy (spec §4.1 "Failure surface").

use thiserror::Error;

use muxi_core::TurnError;

#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    /// `chat` called with no agent registered, and none could be selected.
    #[error("no agents are registered")]
    NoAgents,

    /// The Routing Engine could not resolve `message` to an agent and no
    /// default agent is configured.
    #[error("routing failed to select an agent")]
    RoutingFailed,

    /// `agent_id` was supplied directly but names nothing registered.
    #[error("no agent registered with id {0}")]
    UnknownAgent(String),

    /// A mandatory tool's server was not ready (spec §4.1 "Contracts").
    #[error("required tool unavailable: {0}")]
    ToolUnavailable(String),

    /// The turn's model call failed outright.
    #[error("model request failed: {0}")]
    ModelFailed(String),

    /// Long-Term Memory could not be reached. Read-side failures degrade
    /// the turn to buffer+context (spec §4.1); this variant is reserved for
    /// failures a caller asked to be told about explicitly (e.g.
    /// `search_memory` against an unreachable backend).
    #[error("memory backend unavailable: {0}")]
    MemoryUnavailable(String),

    /// The turn was cancelled before completion.
    #[error("turn cancelled")]
    Cancelled,

    /// The stream consumer could not keep up (spec §5 "Backpressure").
    #[error("stream consumer too slow")]
    ConsumerSlow,

    /// Exceeded the agent's configured `max_tool_rounds`.
    #[error("tool call loop exceeded {0} rounds")]
    ToolLoopExceeded(u32),

    /// No chunk arrived within the configured stall window.
    #[error("model stalled: no chunk received for {0}s")]
    ModelStalled(u64),
}

impl OrchestratorError {
    /// Lift a turn-fatal error into the orchestrator's own taxonomy,
    /// preserving which spec.md §4.1 failure bucket it belongs to.
    pub fn from_turn_error(err: TurnError) -> Self {
        match err {
            TurnError::ToolUnavailable { server_id } => OrchestratorError::ToolUnavailable(server_id),
            TurnError::ModelFailed(message) => OrchestratorError::ModelFailed(message),
            TurnError::ModelStalled { elapsed_secs } => OrchestratorError::ModelStalled(elapsed_secs),
            TurnError::Cancelled => OrchestratorError::Cancelled,
            TurnError::ConsumerSlow => OrchestratorError::ConsumerSlow,
            TurnError::ToolLoopExceeded { max_rounds } => OrchestratorError::ToolLoopExceeded(max_rounds),
        }
    }
}
