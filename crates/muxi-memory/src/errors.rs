// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors surfaced by Long-Term Memory and Memobase.
///
/// Fatal to the turn per spec §7 ("DimensionMismatch"); everything else here
/// is a best-effort-degrade candidate from the caller's point of view — the
/// Orchestrator logs a warning and falls back to buffer+context only rather
/// than propagating a `Backend` error as a turn failure.
#[derive(Debug, Error, Clone)]
pub enum MemoryError {
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("long-term backend error: {0}")]
    Backend(String),
}
