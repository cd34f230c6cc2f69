// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Knowledge Sources: a file-backed, chunked, embedded corpus loaded at
//! agent registration. Embeddings are cached on disk keyed by chunk content
//! hash and vector dimension, regenerated on content change.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use muxi_model::ModelProvider;

use crate::shared::Shared;

/// Maximum bytes read from a single knowledge source file.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
/// Target chunk size, in bytes, before a paragraph boundary is forced.
const CHUNK_TARGET_BYTES: usize = 800;

/// One chunk of a knowledge source's corpus.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub content: String,
    pub source: String,
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
}

/// A single search result (spec §4.9: "`{content, source, relevance}`,
/// never mutates").
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub content: String,
    pub source: String,
    pub relevance: f32,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheFile {
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CacheEntry {
    hash: String,
    embedding: Vec<f32>,
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split raw text into paragraph-aligned chunks of roughly
/// `CHUNK_TARGET_BYTES` each.
fn chunk_text(raw: &str) -> Vec<String> {
    let paragraphs: Vec<&str> = raw.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect();
    let mut chunks = Vec::new();
    let mut current = String::new();
    for p in paragraphs {
        if !current.is_empty() && current.len() + p.len() > CHUNK_TARGET_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(p);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Recursively discover `.md`/`.txt` files under `paths` (files are taken
/// as-is; directories are walked one level of recursion at a time).
fn discover_files(paths: &[String]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for p in paths {
        let path = Path::new(p);
        collect(path, &mut out);
    }
    out.sort();
    out
}

fn collect(path: &Path, out: &mut Vec<PathBuf>) {
    if path.is_file() {
        let ok_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if ok_ext {
            out.push(path.to_path_buf());
        }
        return;
    }
    if path.is_dir() {
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            collect(&entry.path(), out);
        }
    }
}

/// A named, file-backed knowledge corpus attached to an agent.
pub struct KnowledgeSource {
    name: String,
    cache_dir: PathBuf,
    chunks: Shared<Chunk>,
}

impl KnowledgeSource {
    pub fn new(name: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cache_dir: cache_dir.into(),
            chunks: Shared::empty(),
        }
    }

    fn cache_path(&self, dimension: usize) -> PathBuf {
        self.cache_dir.join(format!("{}-d{dimension}.json", self.name))
    }

    fn read_cache(&self, dimension: usize) -> CacheFile {
        let path = self.cache_path(dimension);
        fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write_cache(&self, dimension: usize, cache: &CacheFile) {
        if let Err(e) = fs::create_dir_all(&self.cache_dir) {
            warn!(error = %e, "failed to create knowledge cache dir");
            return;
        }
        if let Ok(json) = serde_json::to_string(cache) {
            if let Err(e) = fs::write(self.cache_path(dimension), json) {
                warn!(error = %e, "failed to write knowledge cache");
            }
        }
    }

    /// Load and chunk every file under `paths`, embedding chunks whose
    /// content hash is not already in the on-disk cache for `dimension`.
    pub async fn load(
        &self,
        paths: &[String],
        model: &dyn ModelProvider,
        dimension: usize,
    ) -> anyhow::Result<()> {
        let cache = self.read_cache(dimension);
        let mut cache_by_hash: std::collections::HashMap<String, Vec<f32>> = cache
            .entries
            .into_iter()
            .map(|e| (e.hash, e.embedding))
            .collect();

        let files = discover_files(paths);
        let mut raw_chunks: Vec<(String, String, String)> = Vec::new(); // (source, content, hash)
        for file in files {
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            if size > MAX_FILE_BYTES {
                warn!(path = %file.display(), size, "skipping oversized knowledge source file");
                continue;
            }
            let Ok(raw) = fs::read_to_string(&file) else {
                continue;
            };
            let source = file.display().to_string();
            for chunk in chunk_text(&raw) {
                let hash = hash_content(&chunk);
                raw_chunks.push((source.clone(), chunk, hash));
            }
        }

        let to_embed: Vec<usize> = raw_chunks
            .iter()
            .enumerate()
            .filter(|(_, (_, _, hash))| !cache_by_hash.contains_key(hash))
            .map(|(i, _)| i)
            .collect();

        if !to_embed.is_empty() {
            let texts: Vec<String> = to_embed.iter().map(|&i| raw_chunks[i].1.clone()).collect();
            match model.embed(&texts).await {
                Ok(embeddings) => {
                    for (idx, embedding) in to_embed.iter().zip(embeddings.into_iter()) {
                        let hash = raw_chunks[*idx].2.clone();
                        cache_by_hash.insert(hash, embedding);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "knowledge source embedding failed; chunks stay text-only");
                }
            }
        }

        let chunks: Vec<Chunk> = raw_chunks
            .into_iter()
            .map(|(source, content, hash)| {
                let embedding = cache_by_hash.get(&hash).cloned();
                Chunk {
                    content,
                    source,
                    hash,
                    embedding,
                }
            })
            .collect();

        let new_cache = CacheFile {
            entries: cache_by_hash
                .into_iter()
                .map(|(hash, embedding)| CacheEntry { hash, embedding })
                .collect(),
        };
        self.write_cache(dimension, &new_cache);

        self.chunks.set(chunks);
        Ok(())
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    /// Search the corpus. Never mutates (spec §4.9).
    pub fn search(&self, query_embedding: Option<&[f32]>, top_k: usize, threshold: f32) -> Vec<KnowledgeHit> {
        let Some(query) = query_embedding else {
            return Vec::new();
        };
        let chunks = self.chunks.get();
        let mut hits: Vec<KnowledgeHit> = chunks
            .iter()
            .filter_map(|c| {
                let embedding = c.embedding.as_deref()?;
                if embedding.len() != query.len() {
                    return None;
                }
                let relevance = Self::cosine(query, embedding);
                if relevance < threshold {
                    return None;
                }
                Some(KnowledgeHit {
                    content: c.content.clone(),
                    source: c.source.clone(),
                    relevance,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    pub fn len(&self) -> usize {
        self.chunks.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use muxi_model::{CompletionRequest, ResponseStream};

    struct EmbedMock;

    #[async_trait]
    impl ModelProvider for EmbedMock {
        fn name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock"
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            unimplemented!()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, muxi_model::ModelError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[test]
    fn chunk_text_splits_on_blank_lines() {
        let raw = "first paragraph\n\nsecond paragraph";
        let chunks = chunk_text(raw);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("first paragraph"));
        assert!(chunks[0].contains("second paragraph"));
    }

    #[tokio::test]
    async fn load_then_search_finds_matching_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("doc.md");
        fs::write(&file, "alpha content here").unwrap();
        let cache_dir = tmp.path().join("cache");

        let source = KnowledgeSource::new("test", &cache_dir);
        source
            .load(&[file.display().to_string()], &EmbedMock, 2)
            .await
            .unwrap();
        assert_eq!(source.len(), 1);

        let hits = source.search(Some(&[19.0, 1.0]), 5, 0.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, file.display().to_string());
    }

    #[tokio::test]
    async fn search_never_mutates_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("doc.md");
        fs::write(&file, "some content").unwrap();
        let source = KnowledgeSource::new("test", tmp.path().join("cache"));
        source.load(&[file.display().to_string()], &EmbedMock, 2).await.unwrap();
        let before = source.len();
        let _ = source.search(Some(&[1.0, 1.0]), 5, 0.0);
        assert_eq!(source.len(), before);
    }

    #[tokio::test]
    async fn cache_is_reused_on_second_load_without_reembedding() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("doc.md");
        fs::write(&file, "stable content").unwrap();
        let cache_dir = tmp.path().join("cache");

        let source_a = KnowledgeSource::new("test", &cache_dir);
        source_a.load(&[file.display().to_string()], &EmbedMock, 2).await.unwrap();

        let source_b = KnowledgeSource::new("test", &cache_dir);
        source_b.load(&[file.display().to_string()], &EmbedMock, 2).await.unwrap();
        assert_eq!(source_b.len(), 1);
        assert!(source_b.chunks.get()[0].embedding.is_some());
    }
}
