// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Agent data model (spec §3): a configured persona — system prompt,
//! model handle, knowledge sources, and tool scope — that the Turn Pipeline
//! runs turns against. Resolved once at `register_agent` time from
//! `muxi_config::AgentDescriptorConfig`; cheap to clone behind an `Arc`.

use std::collections::HashSet;
use std::time::Duration;

use muxi_config::AgentDescriptorConfig;
use muxi_knowledge::KnowledgeSource;

/// One registered agent. Stateless across turns — per-turn state lives on
/// the turn's task, never here (spec §5 "Agents are otherwise stateless
/// across turns").
pub struct AgentDescriptor {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Key into `Config::providers`, or `None` to use `Config::model`.
    pub model_handle: Option<String>,
    pub knowledge: Vec<KnowledgeSource>,
    pub tool_scope: HashSet<String>,
    /// Tools within `tool_scope` that must be available at dispatch time or
    /// the turn fails with `ToolUnavailable` (spec §4.1 "Contracts").
    pub mandatory_tools: HashSet<String>,
    pub recency_bias: f32,
    pub request_timeout_override: Option<Duration>,
    pub max_tool_rounds: u32,
}

impl AgentDescriptor {
    /// Build a descriptor from configuration, leaving `knowledge` empty —
    /// the caller loads and attaches knowledge sources separately since that
    /// requires an embedding model and is fallible I/O (spec §4.9).
    pub fn from_config(cfg: &AgentDescriptorConfig) -> Self {
        Self {
            agent_id: cfg.agent_id.clone(),
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            system_prompt: cfg.system_prompt.clone(),
            model_handle: cfg.model_handle.clone(),
            knowledge: Vec::new(),
            tool_scope: cfg.tool_scope.iter().cloned().collect(),
            mandatory_tools: cfg.mandatory_tools.iter().cloned().collect(),
            recency_bias: cfg.recency_bias,
            request_timeout_override: cfg.request_timeout_override_secs.map(Duration::from_secs),
            max_tool_rounds: cfg.max_tool_rounds,
        }
    }

    /// `tool_scope` restricted to servers currently reported `ready` (spec
    /// §4.1 "chat must not block on MCP reconnect").
    pub fn ready_tool_scope<'a>(&'a self, ready_servers: &'a HashSet<String>) -> impl Iterator<Item = &'a str> {
        self.tool_scope
            .iter()
            .filter(move |id| ready_servers.contains(id.as_str()))
            .map(String::as_str)
    }

    /// Mandatory tool server ids not currently `ready` (spec §4.1
    /// `ToolUnavailable`).
    pub fn missing_mandatory_servers(&self, ready_servers: &HashSet<String>) -> Vec<String> {
        self.mandatory_tools
            .iter()
            .filter(|id| !ready_servers.contains(id.as_str()))
            .cloned()
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AgentDescriptorConfig {
        AgentDescriptorConfig {
            agent_id: "assistant".into(),
            name: "Assistant".into(),
            description: "general purpose".into(),
            tool_scope: vec!["weather".into(), "search".into()],
            mandatory_tools: vec!["weather".into()],
            ..Default::default()
        }
    }

    #[test]
    fn from_config_carries_tool_scope_as_a_set() {
        let d = AgentDescriptor::from_config(&cfg());
        assert!(d.tool_scope.contains("weather"));
        assert!(d.tool_scope.contains("search"));
    }

    #[test]
    fn ready_tool_scope_excludes_not_ready_servers() {
        let d = AgentDescriptor::from_config(&cfg());
        let mut ready = HashSet::new();
        ready.insert("weather".to_string());
        let scope: Vec<&str> = d.ready_tool_scope(&ready).collect();
        assert_eq!(scope, vec!["weather"]);
    }

    #[test]
    fn missing_mandatory_servers_reports_not_ready_mandatory_tools() {
        let d = AgentDescriptor::from_config(&cfg());
        let ready = HashSet::new();
        let missing = d.missing_mandatory_servers(&ready);
        assert_eq!(missing, vec!["weather".to_string()]);
    }

    #[test]
    fn missing_mandatory_servers_empty_when_ready() {
        let d = AgentDescriptor::from_config(&cfg());
        let mut ready = HashSet::new();
        ready.insert("weather".to_string());
        assert!(d.missing_mandatory_servers(&ready).is_empty());
    }
}
