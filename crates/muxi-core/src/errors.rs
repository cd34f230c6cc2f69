// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Turn Pipeline error taxonomy (spec §7): the subset of the failure surface
//! that aborts a turn outright, as opposed to errors fed back into the
//! model as a `tool` message or swallowed with a logged warning.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TurnError {
    /// Exceeded `max_tool_rounds` without a final, tool-free model reply
    /// (spec §4.2 point 4, §8 boundary behavior).
    #[error("tool call loop exceeded {max_rounds} rounds")]
    ToolLoopExceeded { max_rounds: u32 },

    /// A mandatory tool's server is not `ready` (spec §4.1 "Contracts").
    #[error("required tool unavailable: {server_id}")]
    ToolUnavailable { server_id: String },

    /// Non-recoverable provider error (spec §7 "Fatal to the turn").
    #[error("model request failed: {0}")]
    ModelFailed(String),

    /// No chunk received for the configured stall window (spec §5
    /// "Timeouts").
    #[error("model stalled: no chunk received for {elapsed_secs}s")]
    ModelStalled { elapsed_secs: u64 },

    /// The turn's cancel token fired before completion (spec §5
    /// "Cancellation").
    #[error("turn cancelled")]
    Cancelled,

    /// `stream_sink` could not accept a chunk within the configured
    /// interval (spec §5 "Backpressure").
    #[error("stream consumer too slow")]
    ConsumerSlow,
}

impl TurnError {
    /// Structured `error_kind` for the error envelope (spec §6).
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::ToolLoopExceeded { .. } => "tool_loop_exceeded",
            TurnError::ToolUnavailable { .. } => "tool_unavailable",
            TurnError::ModelFailed(_) => "model_failed",
            TurnError::ModelStalled { .. } => "model_stalled",
            TurnError::Cancelled => "cancelled",
            TurnError::ConsumerSlow => "consumer_slow",
        }
    }

    /// None of `TurnError`'s variants are locally retryable (spec §7:
    /// retryable errors are surfaced from `muxi-mcp`/`muxi-model` before
    /// ever reaching this type).
    pub fn retryable(&self) -> bool {
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
