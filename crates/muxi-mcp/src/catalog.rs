// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lock-free, copy-on-update tool catalog.
//!
//! Readers get a cheap `Arc` snapshot that never observes a
//! partially-updated list; writers replace the whole snapshot atomically.

use std::sync::{Arc, RwLock};

use muxi_tools::Tool;

/// A thread-safe, atomically-replaceable list of tools.
pub struct Shared<T: Send + Sync + 'static>(Arc<RwLock<Arc<[T]>>>);

impl<T: Send + Sync + 'static> Shared<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self(Arc::new(RwLock::new(items.into_boxed_slice().into())))
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    /// Snapshot the current contents. Valid until the next `set`.
    #[must_use]
    pub fn get(&self) -> Arc<[T]> {
        self.0.read().expect("Shared lock poisoned").clone()
    }

    /// Atomically replace the contents.
    pub fn set(&self, items: Vec<T>) {
        let new: Arc<[T]> = items.into_boxed_slice().into();
        *self.0.write().expect("Shared lock poisoned") = new;
    }
}

impl<T: Send + Sync + 'static> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + Sync + 'static> Default for Shared<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Catalog of tools offered by one MCP server, refreshed on every handshake
/// and reconnect.
pub type ServerCatalog = Shared<Tool>;

/// Catalog over the whole MCP Service: all currently-known tools across all
/// registered servers, with a lookup keyed by `(server_id, name)`.
#[derive(Default)]
pub struct Catalog {
    per_server: std::sync::RwLock<std::collections::HashMap<String, ServerCatalog>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_server(&self, server_id: &str) -> ServerCatalog {
        let mut guard = self.per_server.write().expect("catalog lock poisoned");
        guard
            .entry(server_id.to_string())
            .or_insert_with(ServerCatalog::empty)
            .clone()
    }

    pub fn set_tools(&self, server_id: &str, tools: Vec<Tool>) {
        self.ensure_server(server_id).set(tools);
    }

    pub fn remove_server(&self, server_id: &str) {
        self.per_server
            .write()
            .expect("catalog lock poisoned")
            .remove(server_id);
    }

    /// All tools, optionally filtered to one server.
    pub fn list(&self, server_id: Option<&str>) -> Vec<Tool> {
        let guard = self.per_server.read().expect("catalog lock poisoned");
        match server_id {
            Some(id) => guard
                .get(id)
                .map(|c| c.get().iter().cloned().collect())
                .unwrap_or_default(),
            None => guard
                .values()
                .flat_map(|c| c.get().iter().cloned().collect::<Vec<_>>())
                .collect(),
        }
    }

    pub fn find(&self, server_id: &str, name: &str) -> Option<Tool> {
        let guard = self.per_server.read().expect("catalog lock poisoned");
        guard
            .get(server_id)?
            .get()
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
