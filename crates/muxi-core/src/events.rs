// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The stream event union a turn emits to its `stream_sink` (spec §6:
//! `stream of {event ∈ {token, tool_call_start, tool_call_result, done, error}}`).

/// One event delivered to a turn's `stream_sink`, in model-emission order
/// (spec §4.2 "Ordering guarantee": tool-call rounds interleave but chunks
/// from one round are flushed before the next round's chunks begin).
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A text chunk streamed from the model.
    Token(String),
    /// The model requested a tool call; dispatch to the MCP Service starts.
    ToolCallStart { id: String, name: String },
    /// The dispatched tool call returned (`is_error` mirrors
    /// `ToolOutput::is_error`, not a turn failure).
    ToolCallResult { id: String, is_error: bool },
    /// The turn completed successfully.
    Done { tool_rounds: u32, trace_id: String },
    /// The turn failed; `kind` is the `TurnError` variant name for callers
    /// building a structured error envelope (spec §6).
    Error { kind: String, message: String },
}
