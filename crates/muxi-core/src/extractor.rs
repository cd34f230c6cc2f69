// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Memory Extractor (spec §4.7): a detached, post-turn task that asks an
//! LLM what's worth remembering about the user and writes survivors into
//! Memobase. Runs only for known users, gated by the caller's
//! `extraction_interval`/`auto_extract` policy — this module only knows how
//! to extract and persist, not when to trigger.

use std::sync::Arc;

use futures::StreamExt;
use muxi_memory::{Memobase, Source};
use muxi_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, ResponseStream};
use serde::Deserialize;
use serde_json::Value;

/// One surviving `{key, value, confidence, importance}` candidate (spec
/// §4.7 "Prompt").
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub key: String,
    pub value: Value,
    pub confidence: f32,
    pub importance: f32,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    extracted_info: Vec<RawFact>,
}

#[derive(Deserialize)]
struct RawFact {
    key: String,
    value: Value,
    confidence: f32,
    importance: f32,
}

/// Call the extraction model and return facts that clear `confidence_threshold`.
/// Never fails the caller: a model error or an unparsable response yields an
/// empty list rather than propagating (spec §7 treats extraction failures as
/// best-effort, never fatal to anything).
pub async fn extract(
    model: &dyn ModelProvider,
    user_message: &str,
    assistant_reply: &str,
    confidence_threshold: f32,
) -> Vec<ExtractedFact> {
    let prompt = format!(
        "Given this turn, produce JSON {{\"extracted_info\": [{{\"key\": <dotted path>, \"value\": <any>, \"confidence\": <0-1>, \"importance\": <0-1>}}]}}. Only include facts about the user worth remembering long-term.\n\nUser: {user_message}\nAssistant: {assistant_reply}"
    );
    let req = CompletionRequest { messages: vec![Message::user(prompt)], stream: true, ..Default::default() };

    let text = match model.complete(req).await {
        Ok(stream) => drain_text(stream).await,
        Err(e) => {
            tracing::warn!(error = %e, "extraction model call failed");
            return Vec::new();
        }
    };

    let facts = parse_extraction_json(&text).unwrap_or_else(|| parse_extraction_fallback(&text));
    facts.into_iter().filter(|f| f.confidence >= confidence_threshold).collect()
}

/// Spawn extraction as a task detached from the turn that produced it (spec
/// §5 "Extractor tasks are detached from the turn; cancellation of the turn
/// does not cancel extraction"). The returned handle is for tests and
/// best-effort shutdown draining only — callers are not expected to await it
/// in the request path.
pub fn spawn_extraction(
    model: Arc<dyn ModelProvider>,
    memobase: Arc<Memobase>,
    user_id: u64,
    user_message: String,
    assistant_reply: String,
    confidence_threshold: f32,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let facts = extract(model.as_ref(), &user_message, &assistant_reply, confidence_threshold).await;
        let written = facts.len();
        for fact in facts {
            memobase.put(user_id, fact.key, fact.value, fact.importance, Source::Extraction);
        }
        written
    })
}

async fn drain_text(mut stream: ResponseStream) -> String {
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

/// Parse `{"extracted_info": [...]}`, tolerating surrounding prose or a
/// markdown code fence around the object (spec §4.7 "Parse").
fn parse_extraction_json(text: &str) -> Option<Vec<ExtractedFact>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let response: ExtractionResponse = serde_json::from_str(&text[start..=end]).ok()?;
    Some(
        response
            .extracted_info
            .into_iter()
            .map(|raw| ExtractedFact {
                key: raw.key,
                value: raw.value,
                confidence: raw.confidence.clamp(0.0, 1.0),
                importance: raw.importance.clamp(0.0, 1.0),
            })
            .collect(),
    )
}

/// Fallback grammar for malformed JSON (spec §4.7): `key:`/`value:`/
/// `confidence:`/`importance:` pairs, one fact per blank-line-separated
/// block. A block missing any of the four fields is dropped.
fn parse_extraction_fallback(text: &str) -> Vec<ExtractedFact> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut key = None;
            let mut value = None;
            let mut confidence = None;
            let mut importance = None;
            for line in block.lines() {
                let line = line.trim();
                if let Some(v) = field(line, "key:") {
                    key = Some(v.to_string());
                } else if let Some(v) = field(line, "value:") {
                    value = Some(v.to_string());
                } else if let Some(v) = field(line, "confidence:") {
                    confidence = v.parse::<f32>().ok();
                } else if let Some(v) = field(line, "importance:") {
                    importance = v.parse::<f32>().ok();
                }
            }
            Some(ExtractedFact {
                key: key?,
                value: Value::String(value?),
                confidence: confidence?.clamp(0.0, 1.0),
                importance: importance?.clamp(0.0, 1.0),
            })
        })
        .collect()
}

fn field<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(line[prefix.len()..].trim())
    } else {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use muxi_model::ScriptedMockProvider;

    use super::*;

    #[test]
    fn parse_json_extracts_facts_from_clean_response() {
        let text = r#"{"extracted_info": [{"key": "likes.color", "value": "blue", "confidence": 0.9, "importance": 0.4}]}"#;
        let facts = parse_extraction_json(text).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "likes.color");
        assert_eq!(facts[0].value, Value::String("blue".into()));
    }

    #[test]
    fn parse_json_tolerates_a_markdown_fence() {
        let text = "Here you go:\n```json\n{\"extracted_info\": [{\"key\": \"k\", \"value\": 1, \"confidence\": 0.5, \"importance\": 0.5}]}\n```";
        let facts = parse_extraction_json(text).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "k");
    }

    #[test]
    fn parse_json_returns_none_for_prose_without_braces() {
        assert!(parse_extraction_json("I found nothing worth remembering.").is_none());
    }

    #[test]
    fn fallback_parses_key_value_blocks() {
        let text = "key: likes.color\nvalue: blue\nconfidence: 0.8\nimportance: 0.3\n\nkey: likes.food\nvalue: pizza\nconfidence: 0.6\nimportance: 0.2";
        let facts = parse_extraction_fallback(text);
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].key, "likes.color");
        assert_eq!(facts[1].key, "likes.food");
    }

    #[test]
    fn fallback_drops_incomplete_blocks() {
        let text = "key: likes.color\nvalue: blue\n\nconfidence: 0.9\nimportance: 0.1";
        let facts = parse_extraction_fallback(text);
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn extract_filters_out_low_confidence_facts() {
        let model = ScriptedMockProvider::always_text(
            r#"{"extracted_info": [{"key": "a", "value": 1, "confidence": 0.9, "importance": 0.5}, {"key": "b", "value": 2, "confidence": 0.2, "importance": 0.5}]}"#,
        );
        let facts = extract(&model, "I love hiking", "That's great!", 0.5).await;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "a");
    }

    #[tokio::test]
    async fn extract_returns_empty_when_model_call_fails() {
        struct FailingProvider;
        #[async_trait::async_trait]
        impl ModelProvider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            fn model_name(&self) -> &str {
                "failing-model"
            }
            async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
                anyhow::bail!("provider unavailable")
            }
        }
        let facts = extract(&FailingProvider, "hi", "hello", 0.0).await;
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn spawn_extraction_writes_surviving_facts_to_memobase() {
        let model: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text(
            r#"{"extracted_info": [{"key": "likes.color", "value": "blue", "confidence": 0.9, "importance": 0.5}]}"#,
        ));
        let memobase = Arc::new(Memobase::new());
        let handle = spawn_extraction(model, memobase.clone(), 7, "I love blue".into(), "Noted!".into(), 0.5);
        let written = handle.await.unwrap();
        assert_eq!(written, 1);
        let entries = memobase.get(7);
        assert_eq!(entries.iter().find(|(k, _)| k == "likes.color").map(|(_, e)| &e.value), Some(&Value::String("blue".into())));
    }
}
