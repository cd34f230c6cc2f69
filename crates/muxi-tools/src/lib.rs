// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod tool;

pub use tool::{Tool, ToolCall, ToolOutput, ToolOutputPart};
