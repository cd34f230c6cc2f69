// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Long-Term Memory (spec §4.5): a persistent, user-partitioned vector store.
//!
//! The spec assumes "an abstract driver with `upsert`, `delete`,
//! `search_by_vector(vector, k, filter)` capabilities" (spec §9) over
//! PostgreSQL+pgvector or SQLite+vec. No vector SQLite extension is in this
//! workspace's dependency set (see DESIGN.md), so [`SqliteLongTermStore`]
//! does the honest substitute: a `user_id`-filtered SQL scan followed by an
//! in-process cosine scoring pass, behind the same `LongTermStore` trait a
//! pgvector-backed driver would implement.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::MemoryError;

/// Metadata filter applied to a Long-Term Memory operation. `user_id` is
/// mandatory for every query except explicitly system-level records (spec
/// §4.5 "Isolation").
#[derive(Debug, Clone, Default)]
pub struct LongTermFilter {
    pub user_id: Option<u64>,
    pub agent_id: Option<String>,
}

/// One persisted record (spec §3 `LongTermRecord`).
#[derive(Debug, Clone)]
pub struct LongTermRecord {
    pub id: String,
    pub user_id: u64,
    pub agent_id: Option<String>,
    pub content: String,
    pub metadata: Value,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LongTermHit {
    pub record: LongTermRecord,
    pub score: f32,
}

/// Abstract backend contract (spec §9 "duck-typed memory backends").
#[async_trait]
pub trait LongTermStore: Send + Sync {
    async fn add(
        &self,
        content: String,
        embedding: Vec<f32>,
        metadata: Value,
        importance: f32,
        user_id: u64,
        agent_id: Option<String>,
    ) -> Result<String, MemoryError>;

    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter: LongTermFilter,
    ) -> Result<Vec<LongTermHit>, MemoryError>;

    async fn delete(&self, id: &str) -> Result<(), MemoryError>;

    async fn delete_by_filter(&self, filter: LongTermFilter) -> Result<u64, MemoryError>;
}

fn encode_vec(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
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

/// SQLite-backed [`LongTermStore`]. Opens (and migrates) the database at
/// construction time; all subsequent I/O runs on `spawn_blocking` since
/// `rusqlite::Connection` is synchronous.
pub struct SqliteLongTermStore {
    conn: Arc<Mutex<Connection>>,
    dimension: usize,
}

impl SqliteLongTermStore {
    pub fn open(path: &str, dimension: usize) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS long_term (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                agent_id TEXT,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                importance REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS long_term_user_idx ON long_term(user_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dimension,
        })
    }

    pub fn open_in_memory(dimension: usize) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE long_term (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                agent_id TEXT,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                importance REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX long_term_user_idx ON long_term(user_id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dimension,
        })
    }
}

#[async_trait]
impl LongTermStore for SqliteLongTermStore {
    async fn add(
        &self,
        content: String,
        embedding: Vec<f32>,
        metadata: Value,
        importance: f32,
        user_id: u64,
        agent_id: Option<String>,
    ) -> Result<String, MemoryError> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.clone();
        let created_at = Utc::now();
        let metadata_text = metadata.to_string();
        let result_id = id.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MemoryError> {
            let guard = conn.lock().expect("sqlite lock poisoned");
            guard
                .execute(
                    "INSERT INTO long_term (id, user_id, agent_id, content, embedding, metadata, importance, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        id,
                        user_id as i64,
                        agent_id,
                        content,
                        encode_vec(&embedding),
                        metadata_text,
                        importance,
                        created_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| MemoryError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))??;
        Ok(result_id)
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
        filter: LongTermFilter,
    ) -> Result<Vec<LongTermHit>, MemoryError> {
        if query_embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                got: query_embedding.len(),
            });
        }
        let conn = self.conn.clone();
        let query = query_embedding.to_vec();
        let rows: Vec<(LongTermRecord, Vec<f32>)> = tokio::task::spawn_blocking(move || -> Result<_, MemoryError> {
            let guard = conn.lock().expect("sqlite lock poisoned");
            let (sql, uid_param) = match filter.user_id {
                Some(uid) => (
                    "SELECT id, user_id, agent_id, content, embedding, metadata, importance, created_at \
                     FROM long_term WHERE user_id = ?1",
                    Some(uid as i64),
                ),
                None => (
                    "SELECT id, user_id, agent_id, content, embedding, metadata, importance, created_at \
                     FROM long_term",
                    None,
                ),
            };
            let mut stmt = guard.prepare(sql).map_err(|e| MemoryError::Backend(e.to_string()))?;
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(LongTermRecord, Vec<f32>)> {
                let created_at_text: String = row.get(7)?;
                let metadata_text: String = row.get(5)?;
                let embedding_bytes: Vec<u8> = row.get(4)?;
                Ok((
                    LongTermRecord {
                        id: row.get(0)?,
                        user_id: row.get::<_, i64>(1)? as u64,
                        agent_id: row.get(2)?,
                        content: row.get(3)?,
                        metadata: serde_json::from_str(&metadata_text).unwrap_or(Value::Null),
                        importance: row.get(6)?,
                        created_at: DateTime::parse_from_rfc3339(&created_at_text)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    },
                    decode_vec(&embedding_bytes),
                ))
            };
            let rows = if let Some(uid) = uid_param {
                stmt.query_map([uid], map_row)
            } else {
                stmt.query_map([], map_row)
            }
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(|e| MemoryError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))??;

        let agent_filter = filter.agent_id;
        let mut hits: Vec<LongTermHit> = rows
            .into_iter()
            .filter(|(r, _)| agent_filter.as_deref().map_or(true, |a| r.agent_id.as_deref() == Some(a)))
            .map(|(record, embedding)| {
                let score = cosine(&query, &embedding);
                LongTermHit { record, score }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), MemoryError> {
            let guard = conn.lock().expect("sqlite lock poisoned");
            guard
                .execute("DELETE FROM long_term WHERE id = ?1", [id])
                .map_err(|e| MemoryError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?
    }

    async fn delete_by_filter(&self, filter: LongTermFilter) -> Result<u64, MemoryError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, MemoryError> {
            let guard = conn.lock().expect("sqlite lock poisoned");
            let affected = match (filter.user_id, filter.agent_id) {
                (Some(uid), Some(aid)) => guard
                    .execute(
                        "DELETE FROM long_term WHERE user_id = ?1 AND agent_id = ?2",
                        rusqlite::params![uid as i64, aid],
                    )
                    .map_err(|e| MemoryError::Backend(e.to_string()))?,
                (Some(uid), None) => guard
                    .execute("DELETE FROM long_term WHERE user_id = ?1", [uid as i64])
                    .map_err(|e| MemoryError::Backend(e.to_string()))?,
                (None, _) => guard
                    .execute("DELETE FROM long_term", [])
                    .map_err(|e| MemoryError::Backend(e.to_string()))?,
            };
            Ok(affected as u64)
        })
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
