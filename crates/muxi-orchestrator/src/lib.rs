// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Orchestrator (spec §4.1): the single process-wide coordinator that
//! owns the agent registry, the Routing Engine, the MCP Service, and the
//! memory stack, and exposes `chat` as the system's one entry point.

mod errors;
mod orchestrator;
mod routing;

pub use errors::OrchestratorError;
pub use orchestrator::{AgentEntry, ChatRequest, MemoryScope, MemorySearchHit, Orchestrator};
pub use routing::Router;
