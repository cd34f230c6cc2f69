// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Routing Engine (spec §4.8): resolves a message to an agent id,
//! caching the result under a message fingerprint with a wall-clock TTL.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};

use muxi_config::RoutingConfig;
use muxi_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};

use crate::orchestrator::AgentEntry;

#[derive(Debug, Clone)]
struct RoutingCacheEntry {
    agent_id: String,
    expires_at: DateTime<Utc>,
}

/// `hash(lowercase+collapse-whitespace(message))` (spec §4.1 point 1).
fn fingerprint(message: &str) -> [u8; 32] {
    let normalized = message.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

/// Selects an agent for a message not already pinned to one by the caller.
/// Cache reads and writes go through a single `RwLock` — simple over
/// sharded, per spec.md §9's "implementer's choice" on cache structure, and
/// small enough that contention is not a concern at agent-registry scale.
pub struct Router {
    cache: RwLock<HashMap<[u8; 32], RoutingCacheEntry>>,
    cache_ttl: Duration,
    default_agent_id: Option<String>,
}

impl Router {
    pub fn new(cfg: &RoutingConfig) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
            default_agent_id: cfg.default_agent_id.clone(),
        }
    }

    fn cache_get(&self, fp: &[u8; 32]) -> Option<String> {
        let guard = self.cache.read().expect("routing cache lock poisoned");
        guard.get(fp).filter(|e| e.expires_at > Utc::now()).map(|e| e.agent_id.clone())
    }

    fn cache_put(&self, fp: [u8; 32], agent_id: String) {
        let mut guard = self.cache.write().expect("routing cache lock poisoned");
        guard.insert(fp, RoutingCacheEntry { agent_id, expires_at: Utc::now() + self.cache_ttl });
    }

    fn default_agent(&self, agents: &[std::sync::Arc<AgentEntry>]) -> Option<String> {
        if let Some(default_id) = &self.default_agent_id {
            if agents.iter().any(|a| &a.descriptor.agent_id == default_id) {
                return Some(default_id.clone());
            }
        }
        agents.first().map(|a| a.descriptor.agent_id.clone())
    }

    /// Resolve `message` to an agent id (spec §4.1 "Routing"). `agents` must
    /// be non-empty and ordered by registration (earliest first) so model
    /// responses naming more than one known id tie-break predictably.
    pub async fn select_agent(
        &self,
        message: &str,
        agents: &[std::sync::Arc<AgentEntry>],
        routing_model: Option<&dyn ModelProvider>,
    ) -> Option<String> {
        let fp = fingerprint(message);
        if let Some(cached) = self.cache_get(&fp) {
            return Some(cached);
        }

        let chosen = match routing_model {
            Some(model) => self.ask_model(model, message, agents).await.or_else(|| self.default_agent(agents)),
            None => self.default_agent(agents),
        }?;

        self.cache_put(fp, chosen.clone());
        Some(chosen)
    }

    async fn ask_model(&self, model: &dyn ModelProvider, message: &str, agents: &[std::sync::Arc<AgentEntry>]) -> Option<String> {
        let roster: String = agents
            .iter()
            .map(|a| format!("- {}: {}", a.descriptor.agent_id, a.descriptor.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Choose the single best agent id for this message. Reply with only the id, nothing else.\n\nAgents:\n{roster}\n\nMessage: {message}"
        );
        let req = CompletionRequest { messages: vec![Message::user(prompt)], stream: true, ..Default::default() };

        let stream = model.complete(req).await.ok()?;
        let text = drain_text(stream).await;
        let normalized = text.trim().to_lowercase();
        agents.iter().find(|a| normalized.contains(&a.descriptor.agent_id.to_lowercase())).map(|a| a.descriptor.agent_id.clone())
    }
}

async fn drain_text(mut stream: muxi_model::ResponseStream) -> String {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(ResponseEvent::TextDelta(chunk)) => text.push_str(&chunk),
            Ok(ResponseEvent::Done) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    text
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
