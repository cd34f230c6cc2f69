// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Memobase (spec §4.6): structured per-user facts, read on every turn.
//!
//! A single `RwLock` guards the whole table rather than a per-key lock —
//! coarser than spec §5's "Memobase updates under the same `(user_id, key)`
//! are linearized (per-key lock)" strictly requires, but a superset of it:
//! a global writer lock linearizes *every* key, not just the contended one.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Manual,
    Extraction,
}

#[derive(Debug, Clone)]
pub struct UserContextEntry {
    pub value: Value,
    pub importance: f32,
    pub source: Source,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// The importance gate rejected the write (spec §4.6 "reject silently").
    Skipped,
}

#[derive(Default)]
pub struct Memobase {
    entries: RwLock<HashMap<(u64, String), UserContextEntry>>,
}

impl Memobase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Importance-gated upsert (spec §3 `UserContextEntry` overwrite policy,
    /// §4.6 conflict resolution). A new write replaces the existing entry
    /// iff `new.importance >= existing.importance`, except a tie against an
    /// existing `Manual` entry from an incoming `Extraction` write — manual
    /// writes always win ties.
    pub fn put(&self, user_id: u64, key: impl Into<String>, value: Value, importance: f32, source: Source) -> PutOutcome {
        let key = key.into();
        let mut guard = self.entries.write().expect("memobase lock poisoned");
        match guard.get(&(user_id, key.clone())) {
            None => {
                guard.insert(
                    (user_id, key),
                    UserContextEntry {
                        value,
                        importance,
                        source,
                        updated_at: Utc::now(),
                    },
                );
                PutOutcome::Inserted
            }
            Some(existing) => {
                let tie = (importance - existing.importance).abs() < f32::EPSILON;
                let manual_defends_tie = tie && existing.source == Source::Manual && source == Source::Extraction;
                if importance >= existing.importance && !manual_defends_tie {
                    guard.insert(
                        (user_id, key),
                        UserContextEntry {
                            value,
                            importance,
                            source,
                            updated_at: Utc::now(),
                        },
                    );
                    PutOutcome::Updated
                } else {
                    PutOutcome::Skipped
                }
            }
        }
    }

    /// Full read for one user, sorted by importance descending (rendering
    /// order per spec §4.2 "composing").
    pub fn get(&self, user_id: u64) -> Vec<(String, UserContextEntry)> {
        let guard = self.entries.read().expect("memobase lock poisoned");
        let mut out: Vec<(String, UserContextEntry)> = guard
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| b.1.importance.partial_cmp(&a.1.importance).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// In-place value change; importance and source are preserved (spec
    /// §4.6 `update`).
    pub fn update(&self, user_id: u64, key: &str, value: Value) -> bool {
        let mut guard = self.entries.write().expect("memobase lock poisoned");
        match guard.get_mut(&(user_id, key.to_string())) {
            Some(entry) => {
                entry.value = value;
                entry.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Delete one key, or every key for `user_id` when `key` is `None`.
    pub fn delete(&self, user_id: u64, key: Option<&str>) {
        let mut guard = self.entries.write().expect("memobase lock poisoned");
        match key {
            Some(k) => {
                guard.remove(&(user_id, k.to_string()));
            }
            None => {
                guard.retain(|(uid, _), _| *uid != user_id);
            }
        }
    }

    /// Render the user-context block for prompt composition, truncated to
    /// `budget` bytes (spec §4.2 "truncated to configured budget").
    pub fn render(&self, user_id: u64, budget: usize) -> String {
        let mut out = String::new();
        for (key, entry) in self.get(user_id) {
            let line = format!("{key}: {}\n", entry.value);
            if out.len() + line.len() > budget {
                break;
            }
            out.push_str(&line);
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
