// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A cheap, clonable cancel signal.
//!
//! Used both by [`crate::McpService::invoke`] (cancel a single in-flight
//! tool call) and by the turn pipeline's whole-turn cancellation (spec §5:
//! "cancels outstanding `MCPService.invoke` via their tokens").

use tokio::sync::watch;

/// Caller-held handle that fires a [`CancelToken`].
#[derive(Clone)]
pub struct CancelHandle(watch::Sender<bool>);

/// Callee-held token, checked or awaited for cancellation.
#[derive(Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelHandle {
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelToken(rx))
    }

    /// Fire the cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new().0
    }
}

impl CancelToken {
    /// A token that never fires. Used where the caller has no cancellation
    /// mechanism of its own (e.g. background extraction).
    pub fn never() -> Self {
        CancelHandle::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation fires. Returns immediately if already
    /// cancelled.
    pub async fn cancelled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                // Sender dropped without ever cancelling — never resolves by
                // firing again, so park forever rather than spin.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_and_is_observed() {
        let (handle, mut token) = CancelHandle::new();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[test]
    fn never_token_is_not_cancelled() {
        let t = CancelToken::never();
        assert!(!t.is_cancelled());
    }
}
