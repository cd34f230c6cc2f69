// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Generic thread-safe shared list for live-refreshable collections.
//!
//! [`Shared<T>`] is a thin wrapper around `Arc<RwLock<Arc<[T]>>>` providing
//! cheap snapshot reads and atomic batch replacement. Used to publish a
//! knowledge source's chunk list so readers never observe a half-updated
//! corpus mid-reload.

use std::sync::{Arc, RwLock};

pub struct Shared<T: Send + Sync + 'static>(Arc<RwLock<Arc<[T]>>>);

impl<T: Send + Sync + 'static> Shared<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self(Arc::new(RwLock::new(items.into_boxed_slice().into())))
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }

    #[must_use]
    pub fn get(&self) -> Arc<[T]> {
        self.0.read().expect("Shared lock poisoned").clone()
    }

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
