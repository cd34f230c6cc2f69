// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for model-client operations.
//!
//! Mirrors the "Fatal to the turn" / "Non-fatal" split used throughout the
//! orchestration runtime: a [`ModelError`] is always surfaced to the caller
//! (the Agent decides whether to retry, degrade, or fail the turn), never
//! swallowed inside this crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("provider {provider} does not support embeddings")]
    EmbeddingsUnsupported { provider: String },

    #[error("model stalled: no chunk received for {elapsed_secs}s")]
    Stalled { elapsed_secs: u64 },

    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned an error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ModelError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ModelError::Request(_) | ModelError::Provider { retryable: true, .. }
        )
    }
}
