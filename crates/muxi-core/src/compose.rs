// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Turn Pipeline's `composing` step (spec §4.2): assembles the message
//! list sent to the model from the system prompt, rendered user-context
//! facts, the unioned Buffer/Long-Term retrieval block, and matching
//! knowledge chunks. Styled on `prompts.rs`'s budget-truncated,
//! XML-tag-wrapped section idiom.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use tracing::warn;

use muxi_memory::{BufferMemory, Filter as BufferFilter, LongTermFilter, LongTermStore, Memobase};
use muxi_model::Message;

use crate::descriptor::AgentDescriptor;

/// Character budget for the `<retrieved_memories>` block.
pub const MAX_RETRIEVAL_PROMPT_CHARS: usize = 12_000;
/// Character budget for the `<user_context>` block.
pub const MAX_USER_CONTEXT_PROMPT_CHARS: usize = 4_000;
/// Character budget for the `<knowledge>` block.
pub const MAX_KNOWLEDGE_PROMPT_CHARS: usize = 8_000;

/// Everything `compose` needs to assemble one turn's prompt. Borrowed rather
/// than owned — the turn pipeline holds the real subsystems behind `Arc`s and
/// only needs them for the duration of this call.
pub struct ComposeInputs<'a> {
    pub agent: &'a AgentDescriptor,
    pub buffer: &'a BufferMemory,
    /// `None` when Long-Term Memory is unreachable or `user_id == 0` (spec
    /// §4.1: anonymous turns are buffer-only).
    pub long_term: Option<&'a dyn LongTermStore>,
    pub memobase: &'a Memobase,
    pub user_id: u64,
    pub conversation_id: Option<&'a str>,
    pub message: &'a str,
    /// Embedding of `message`, or `None` if embeddings are unavailable
    /// (degrades every search below to its non-semantic fallback).
    pub query_embedding: Option<&'a [f32]>,
    pub buffer_limit: usize,
    pub long_term_limit: usize,
    pub knowledge_top_k: usize,
    pub knowledge_threshold: f32,
}

fn content_hash(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn fit_budget<'a>(entries: &'a [String], budget: usize) -> (&'a [String], bool) {
    let mut used = 0usize;
    let fitted_count = entries
        .iter()
        .take_while(|e| {
            let next = used + e.len();
            if next <= budget {
                used = next;
                true
            } else {
                false
            }
        })
        .count();
    (&entries[..fitted_count], fitted_count < entries.len())
}

/// Assemble the message list for one turn (spec §4.2 "composing").
pub async fn compose(inputs: ComposeInputs<'_>) -> Vec<Message> {
    let mut messages = vec![Message::system(inputs.agent.system_prompt.clone())];

    if inputs.user_id != 0 {
        let rendered = inputs.memobase.render(inputs.user_id, MAX_USER_CONTEXT_PROMPT_CHARS);
        if !rendered.is_empty() {
            messages.push(Message::system(format!("<user_context>\n{rendered}</user_context>")));
        }
    }

    if let Some(block) = retrieval_block(&inputs).await {
        messages.push(Message::system(block));
    }

    if let Some(block) = knowledge_block(&inputs) {
        messages.push(Message::system(block));
    }

    messages.push(Message::user(inputs.message.to_string()));
    messages
}

/// Buffer ∪ Long-Term retrieval, deduplicated by content hash and ordered
/// oldest→newest (spec §4.2).
async fn retrieval_block(inputs: &ComposeInputs<'_>) -> Option<String> {
    let filter = BufferFilter {
        user_id: Some(inputs.user_id),
        agent_id: Some(inputs.agent.agent_id.clone()),
        conversation_id: inputs.conversation_id.map(str::to_string),
    };
    let buffer_hits = inputs.buffer.search(
        inputs.query_embedding,
        inputs.buffer_limit,
        &filter,
        inputs.agent.recency_bias,
    );

    let mut seen: HashSet<u64> = HashSet::new();
    let mut dated: Vec<(DateTime<Utc>, String)> = Vec::new();
    for hit in buffer_hits {
        if seen.insert(content_hash(&hit.content)) {
            dated.push((hit.timestamp, hit.content));
        }
    }

    if inputs.user_id != 0 {
        if let (Some(store), Some(query)) = (inputs.long_term, inputs.query_embedding) {
            let filter = LongTermFilter {
                user_id: Some(inputs.user_id),
                agent_id: Some(inputs.agent.agent_id.clone()),
            };
            match store.search(query, inputs.long_term_limit, filter).await {
                Ok(hits) => {
                    for hit in hits {
                        if seen.insert(content_hash(&hit.record.content)) {
                            dated.push((hit.record.created_at, hit.record.content));
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "long-term memory search failed; degrading to buffer-only retrieval");
                }
            }
        }
    }

    if dated.is_empty() {
        return None;
    }
    dated.sort_by_key(|(ts, _)| *ts);

    let entries: Vec<String> = dated.iter().map(|(_, c)| format!("  <memory>{c}</memory>")).collect();
    let (fitted, truncated) = fit_budget(&entries, MAX_RETRIEVAL_PROMPT_CHARS);
    if fitted.is_empty() {
        return None;
    }
    let note = if truncated {
        format!("\n⚠ Retrieved memories truncated: showing {} of {}.", fitted.len(), entries.len())
    } else {
        String::new()
    };
    Some(format!("<retrieved_memories>{note}\n{}\n</retrieved_memories>", fitted.join("\n")))
}

/// Per-`KnowledgeSource` search with provenance (spec §4.9).
fn knowledge_block(inputs: &ComposeInputs<'_>) -> Option<String> {
    let mut entries = Vec::new();
    for source in &inputs.agent.knowledge {
        for hit in source.search(inputs.query_embedding, inputs.knowledge_top_k, inputs.knowledge_threshold) {
            entries.push(format!("  <chunk source=\"{}\">{}</chunk>", hit.source, hit.content));
        }
    }
    if entries.is_empty() {
        return None;
    }
    let (fitted, truncated) = fit_budget(&entries, MAX_KNOWLEDGE_PROMPT_CHARS);
    if fitted.is_empty() {
        return None;
    }
    let note = if truncated {
        format!("\n⚠ Knowledge truncated: showing {} of {}.", fitted.len(), entries.len())
    } else {
        String::new()
    };
    Some(format!("<knowledge>{note}\n{}\n</knowledge>", fitted.join("\n")))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use muxi_config::VectorMetric;
    use muxi_memory::{Metadata, SqliteLongTermStore};
    use serde_json::Value;

    fn agent() -> AgentDescriptor {
        AgentDescriptor {
            agent_id: "assistant".into(),
            name: "Assistant".into(),
            description: "general purpose".into(),
            system_prompt: "You are a helpful assistant.".into(),
            model_handle: None,
            knowledge: Vec::new(),
            tool_scope: Default::default(),
            mandatory_tools: Default::default(),
            recency_bias: 0.3,
            request_timeout_override: None,
            max_tool_rounds: 6,
        }
    }

    #[tokio::test]
    async fn compose_always_ends_with_the_user_message_last() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: None,
            memobase: &memobase,
            user_id: 7,
            conversation_id: None,
            message: "hello there",
            query_embedding: None,
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        let last = messages.last().unwrap();
        assert_eq!(last.as_text(), Some("hello there"));
    }

    #[tokio::test]
    async fn compose_includes_system_prompt_first() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: None,
            memobase: &memobase,
            user_id: 7,
            conversation_id: None,
            message: "hi",
            query_embedding: None,
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        assert_eq!(messages[0].as_text(), Some("You are a helpful assistant."));
    }

    #[tokio::test]
    async fn anonymous_user_skips_user_context_and_long_term() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        let memobase = Memobase::new();
        memobase.put(0, "k", Value::String("should never render".into()), 1.0, muxi_memory::Source::Manual);
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: None,
            memobase: &memobase,
            user_id: 0,
            conversation_id: None,
            message: "hi",
            query_embedding: None,
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        assert!(!messages.iter().any(|m| m.as_text().unwrap_or("").contains("user_context")));
    }

    #[tokio::test]
    async fn retrieval_block_dedups_identical_content_by_hash() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        buffer.add("likes rust", Metadata::new(7).with_agent("assistant"), None);
        buffer.add("likes rust", Metadata::new(7).with_agent("assistant"), None);
        let memobase = Memobase::new();
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: None,
            memobase: &memobase,
            user_id: 7,
            conversation_id: None,
            message: "what do I like?",
            query_embedding: None,
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        let retrieval = messages
            .iter()
            .find_map(|m| m.as_text().filter(|t| t.contains("retrieved_memories")));
        let block = retrieval.expect("retrieval block present");
        assert_eq!(block.matches("likes rust").count(), 1);
    }

    #[tokio::test]
    async fn retrieval_block_orders_oldest_to_newest() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        buffer.add("first", Metadata::new(7).with_agent("assistant"), None);
        buffer.add("second", Metadata::new(7).with_agent("assistant"), None);
        let memobase = Memobase::new();
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: None,
            memobase: &memobase,
            user_id: 7,
            conversation_id: None,
            message: "recap",
            query_embedding: None,
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        let block = messages
            .iter()
            .find_map(|m| m.as_text().filter(|t| t.contains("retrieved_memories")))
            .unwrap();
        assert!(block.find("first").unwrap() < block.find("second").unwrap());
    }

    #[tokio::test]
    async fn long_term_search_failure_degrades_to_buffer_only() {
        let agent = agent();
        let buffer = BufferMemory::new(10, 1, 1000, VectorMetric::InnerProduct);
        buffer.add("buffered fact", Metadata::new(7).with_agent("assistant"), Some(vec![1.0, 0.0]));
        let memobase = Memobase::new();
        // Dimension-3 store, queried with a dimension-2 embedding: every search fails.
        let store = SqliteLongTermStore::open_in_memory(3).unwrap();
        let messages = compose(ComposeInputs {
            agent: &agent,
            buffer: &buffer,
            long_term: Some(&store),
            memobase: &memobase,
            user_id: 7,
            conversation_id: None,
            message: "recap",
            query_embedding: Some(&[1.0, 0.0]),
            buffer_limit: 10,
            long_term_limit: 10,
            knowledge_top_k: 3,
            knowledge_threshold: 0.0,
        })
        .await;
        let block = messages
            .iter()
            .find_map(|m| m.as_text().filter(|t| t.contains("retrieved_memories")))
            .unwrap();
        assert!(block.contains("buffered fact"));
    }
}
