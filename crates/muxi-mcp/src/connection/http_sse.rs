// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP+SSE MCP transport (spec §4.3, §6).
//!
//! 1. GET the SSE endpoint with `Accept: text/event-stream`.
//! 2. The first event of interest carries a `message_url` (the session's
//!    POST target) as its `data:` payload.
//! 3. Every subsequent `data:` event is a JSON-RPC response correlated by
//!    `id` through the connection's pending-request map.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PendingMap, WriteHalf};
use crate::rpc::RpcResponse;

/// One parsed `text/event-stream` frame (`event:`/`data:` lines up to the
/// next blank line).
#[derive(Default)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

fn parse_events(buf: &str) -> (Vec<SseEvent>, String) {
    let mut events = Vec::new();
    let mut rest = buf;
    while let Some(idx) = rest.find("\n\n") {
        let (frame, tail) = rest.split_at(idx);
        rest = &tail[2..];
        let mut ev = SseEvent::default();
        let mut data_lines = Vec::new();
        for line in frame.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                ev.event = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data_lines.push(v.trim().to_string());
            }
        }
        ev.data = data_lines.join("\n");
        events.push(ev);
    }
    (events, rest.to_string())
}

/// Open the SSE GET, wait for the session's `message_url`, and return the
/// writable half plus a background task that demultiplexes subsequent
/// `data:` events into `pending`.
pub(crate) async fn connect(
    endpoint: &str,
    credentials: Option<String>,
    pending: PendingMap,
) -> anyhow::Result<(WriteHalf, JoinHandle<()>)> {
    let client = reqwest::Client::new();
    let mut req = client.get(endpoint).header("Accept", "text/event-stream");
    if let Some(token) = &credentials {
        req = req.bearer_auth(token);
    }
    let response = req.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("SSE GET failed with status {}", response.status());
    }

    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    let message_url = loop {
        let Some(chunk) = stream.next().await else {
            anyhow::bail!("SSE stream closed before message_url event");
        };
        let chunk = chunk?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        let (events, remainder) = parse_events(&buf);
        buf = remainder;
        if let Some(url_event) = events.iter().find(|e| !e.data.trim().is_empty()) {
            break resolve_message_url(endpoint, &url_event.data);
        }
    };

    let write = WriteHalf::HttpSse {
        client: client.clone(),
        message_url: message_url.clone(),
        credentials,
    };

    let demux = tokio::spawn(async move {
        loop {
            let Some(chunk) = stream.next().await else {
                debug!("SSE stream ended");
                return;
            };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "SSE stream read error");
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            let (events, remainder) = parse_events(&buf);
            buf = remainder;
            for ev in events {
                if ev.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcResponse>(&ev.data) {
                    Ok(resp) => super::deliver(&pending, resp),
                    Err(e) => warn!(error = %e, data = %ev.data, "unparseable SSE data frame"),
                }
            }
        }
    });

    Ok((write, demux))
}

/// Resolve a `message_url` event payload against the SSE endpoint's origin,
/// since servers typically send a path-only value.
fn resolve_message_url(endpoint: &str, raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    match url::Url::parse(endpoint) {
        Ok(base) => base.join(raw).map(|u| u.to_string()).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
