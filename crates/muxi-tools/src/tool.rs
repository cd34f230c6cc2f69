// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by the model, forwarded to the MCP
/// Service's `invoke`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim in the
    /// conversation history and echoed back in `ToolOutput::call_id`).
    pub id: String,
    /// MCP server that owns this tool, resolved by the Agent from the
    /// current tool catalog before dispatch.
    pub server_id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// A single content item in a tool result.
///
/// Most MCP tools return only `Text`; vision-capable tools may return a mix
/// of `Text` and `Image` items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of invoking a tool through the MCP Service.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts), so callers that only need a flat
/// string never have to match on `parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub parts: Vec<ToolOutputPart>,
    /// `true` when the MCP server reported a tool-level failure (spec
    /// §7: recoverable-by-the-model; fed back into the conversation as a
    /// `tool` message rather than becoming a turn error).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
        }
    }

    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                ToolOutputPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
        }
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// A tool as discovered from an MCP server's `tools/list` response.
///
/// This is the catalog entry the MCP Service publishes; the model-facing
/// `ToolSchema` (in `muxi-model`) is derived from it per turn, filtered to
/// the calling agent's tool scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub server_id: String,
    pub name: String,
    pub parameter_schema: Value,
    pub description: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_output_ok_sets_content_and_single_text_part() {
        let out = ToolOutput::ok("c1", "hello");
        assert_eq!(out.content, "hello");
        assert!(!out.is_error);
        assert_eq!(out.parts.len(), 1);
    }

    #[test]
    fn tool_output_err_marks_is_error() {
        let out = ToolOutput::err("c1", "boom");
        assert!(out.is_error);
        assert_eq!(out.content, "boom");
    }

    #[test]
    fn tool_output_with_parts_concatenates_text_parts_only() {
        let out = ToolOutput::with_parts(
            "c1",
            vec![
                ToolOutputPart::Text("a".into()),
                ToolOutputPart::Image("data:image/png;base64,X".into()),
                ToolOutputPart::Text("b".into()),
            ],
        );
        assert_eq!(out.content, "a\nb");
        assert!(out.has_images());
    }

    #[test]
    fn tool_output_without_images_has_images_false() {
        let out = ToolOutput::ok("c1", "text only");
        assert!(!out.has_images());
    }

    #[test]
    fn tool_call_round_trips_through_json() {
        let tc = ToolCall {
            id: "tc1".into(),
            server_id: "weather".into(),
            name: "get_forecast".into(),
            args: serde_json::json!({"city": "Paris"}),
        };
        let s = serde_json::to_string(&tc).unwrap();
        let back: ToolCall = serde_json::from_str(&s).unwrap();
        assert_eq!(back.name, "get_forecast");
        assert_eq!(back.server_id, "weather");
    }
}
