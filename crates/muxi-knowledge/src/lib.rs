// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Knowledge Sources (spec §4.9): static, file-backed, chunked and embedded
//! corpora attached to an agent at registration.

pub mod shared;
pub mod source;

pub use shared::Shared;
pub use source::{Chunk, KnowledgeHit, KnowledgeSource};
