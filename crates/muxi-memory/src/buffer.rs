// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hybrid Buffer Memory (spec §4.4): a bounded short-term ring blending
//! semantic relevance with recency.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use muxi_config::VectorMetric;
use serde_json::Value;

/// Per-record metadata carried by every [`BufferItem`] (spec §3: "Metadata
/// always carries `user_id`...").
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// `0` denotes anonymous; never written to persistent stores.
    pub user_id: u64,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub extra: Value,
}

impl Metadata {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// A filter applied during [`BufferMemory::search`]. `None` fields match
/// anything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub user_id: Option<u64>,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl Filter {
    fn matches(&self, m: &Metadata) -> bool {
        if let Some(uid) = self.user_id {
            if m.user_id != uid {
                return false;
            }
        }
        if let Some(aid) = &self.agent_id {
            if m.agent_id.as_deref() != Some(aid.as_str()) {
                return false;
            }
        }
        if let Some(cid) = &self.conversation_id {
            if m.conversation_id.as_deref() != Some(cid.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One entry in the Buffer ring (spec §3 `BufferItem`).
#[derive(Debug, Clone)]
pub struct BufferItem {
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub content: String,
    pub metadata: Metadata,
    pub score: f32,
    /// Carried through from the source [`BufferItem`] so a caller merging
    /// this hit with Long-Term Memory results can order the union
    /// oldest→newest (spec §4.2 "composing").
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    items: VecDeque<BufferItem>,
    insertions_since_rebuild: usize,
}

/// Bounded in-memory ring with hybrid semantic + recency search.
///
/// Capacity is `context_window * buffer_multiplier` (spec invariant).
/// There is no separate ANN index crate in the dependency set (spec §9
/// leaves the index structure to the implementer); this store keeps the
/// invariant honest with a brute-force scan over `items`, rebuilt — in the
/// sense of re-scored — on the cadence `rebuild_every` would otherwise drive
/// a real index's rebuild.
pub struct BufferMemory {
    capacity: usize,
    rebuild_every: usize,
    metric: VectorMetric,
    inner: RwLock<Inner>,
}

impl BufferMemory {
    pub fn new(context_window: usize, buffer_multiplier: usize, rebuild_every: usize, metric: VectorMetric) -> Self {
        Self {
            capacity: context_window.saturating_mul(buffer_multiplier).max(1),
            rebuild_every: rebuild_every.max(1),
            metric,
            inner: RwLock::new(Inner {
                items: VecDeque::new(),
                insertions_since_rebuild: 0,
            }),
        }
    }

    pub fn from_config(cfg: &muxi_config::MemoryConfig) -> Self {
        Self::new(
            cfg.context_window,
            cfg.buffer_multiplier,
            cfg.rebuild_every,
            cfg.vector_metric,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item. Evicts the oldest item if the ring is at capacity.
    /// Returns immediately — readers observe either the pre- or
    /// post-eviction state, never a dangling mapping (single write lock
    /// covers both the push and the evict).
    pub fn add(&self, content: impl Into<String>, metadata: Metadata, embedding: Option<Vec<f32>>) {
        let mut guard = self.inner.write().expect("buffer lock poisoned");
        guard.items.push_back(BufferItem {
            content: content.into(),
            embedding,
            timestamp: Utc::now(),
            metadata,
        });
        while guard.items.len() > self.capacity {
            guard.items.pop_front();
        }
        guard.insertions_since_rebuild += 1;
        if guard.insertions_since_rebuild >= self.rebuild_every {
            guard.insertions_since_rebuild = 0;
            // A real ANN index would rebuild its structure here. The
            // brute-force scan below is always consistent, so there is
            // nothing further to do — this branch exists to document the
            // cadence named in spec §4.4.
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("buffer lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            VectorMetric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            VectorMetric::InnerProduct => {
                let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
                1.0 - dot
            }
        }
    }

    /// Hybrid semantic + recency search (spec §4.4).
    ///
    /// When `query_embedding` is `None` (embeddings unavailable, or the
    /// query could not be embedded), falls back to pure recency: the
    /// `limit` most recent items matching `filter`, newest first.
    pub fn search(
        &self,
        query_embedding: Option<&[f32]>,
        limit: usize,
        filter: &Filter,
        recency_bias: f32,
    ) -> Vec<SearchHit> {
        let guard = self.inner.read().expect("buffer lock poisoned");

        let Some(query) = query_embedding else {
            return guard
                .items
                .iter()
                .rev()
                .filter(|it| filter.matches(&it.metadata))
                .take(limit)
                .map(|it| SearchHit {
                    content: it.content.clone(),
                    metadata: it.metadata.clone(),
                    score: 1.0,
                    timestamp: it.timestamp,
                })
                .collect();
        };

        let recency_bias = recency_bias.clamp(0.0, 1.0);
        let mut scored: Vec<(f32, usize, &BufferItem)> = guard
            .items
            .iter()
            .enumerate()
            .filter_map(|(pos, it)| {
                let emb = it.embedding.as_deref()?;
                if emb.len() != query.len() {
                    return None;
                }
                let distance = self.distance(query, emb);
                let semantic_score = 1.0 / (1.0 + distance.max(0.0));
                Some((semantic_score, pos, it))
            })
            .collect();

        // Top 2*limit by pure semantic score before the metadata filter and
        // recency blend (spec §4.4).
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit.saturating_mul(2).max(limit));

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .filter(|(_, _, it)| filter.matches(&it.metadata))
            .map(|(semantic_score, pos, it)| {
                let recency_score = 1.0 - (pos as f32 / self.capacity.max(1) as f32);
                let score = (1.0 - recency_bias) * semantic_score + recency_bias * recency_score;
                SearchHit {
                    content: it.content.clone(),
                    metadata: it.metadata.clone(),
                    score,
                    timestamp: it.timestamp,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        hits
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
