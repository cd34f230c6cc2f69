// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub agents: Vec<AgentDescriptorConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name from `model_handle` on an agent descriptor.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Common values: "openai" | "anthropic" | "google" |
    /// "azure" | "aws" | "cohere" | "openrouter" | "groq" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override. Useful for local proxies, LiteLLM, or Cloudflare.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0-2.0).
    pub temperature: Option<f32>,

    /// Model used for embedding calls (Buffer/Long-Term Memory, Knowledge
    /// Sources). Defaults to `name` when unset — many providers serve both
    /// chat and embedding endpoints from the same base configuration, but a
    /// dedicated embedding model (e.g. `text-embedding-3-small`) is common.
    pub embedding_model: Option<String>,
    /// Fixed embedding vector dimension `D`. Checked on every memory insert;
    /// a vector of the wrong dimension fails with `DimensionMismatch`.
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    // ── Azure OpenAI ─────────────────────────────────────────────────────────
    pub azure_resource: Option<String>,
    pub azure_deployment: Option<String>,
    pub azure_api_version: Option<String>,

    // ── AWS Bedrock ───────────────────────────────────────────────────────────
    pub aws_region: Option<String>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// **Anthropic**: adds `"cache_control": {"type": "ephemeral"}` to the
    /// system block, which tells the API to cache the prefix up to and
    /// including that block. Anthropic charges a one-time write fee and
    /// subsequent calls save ~90% on cached input tokens.
    ///
    /// **Other providers**: OpenAI and Google cache automatically; this flag
    /// has no effect for those providers.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,

    /// Use the extended (1-hour) cache TTL instead of the default 5-minute
    /// window. Only meaningful for the Anthropic provider.
    #[serde(default)]
    pub extended_cache_time: bool,

    /// Cache tool definitions using Anthropic prompt caching.
    #[serde(default = "default_true")]
    pub cache_tools: bool,

    /// Enable automatic conversation caching (Anthropic only).
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    /// Cache image blocks using Anthropic prompt caching.
    #[serde(default = "default_true")]
    pub cache_images: bool,

    /// Cache tool-result blocks using Anthropic prompt caching.
    #[serde(default = "default_true")]
    pub cache_tool_results: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to YAML mock-responses file (used when provider = "mock"). Can
    /// also be set via the MUXI_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,
}

fn default_embedding_dimension() -> usize {
    1536
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            // api_key_env is intentionally None here. resolve_api_key() falls
            // through to the driver registry, which already knows the
            // canonical env-var name for each provider (OPENAI_API_KEY,
            // ANTHROPIC_API_KEY, etc). Hard-coding it here would shadow the
            // registry lookup and send the wrong key on a per-agent override.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            embedding_model: None,
            embedding_dimension: default_embedding_dimension(),
            azure_resource: None,
            azure_deployment: None,
            azure_api_version: None,
            aws_region: None,
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            cache_images: true,
            cache_tool_results: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
        }
    }
}

fn default_routing_cache_ttl_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Named provider entry (see `Config::providers`) used for agent
    /// selection. `None` falls back to `Config::model`. A dedicated, usually
    /// smaller, model keeps routing latency low.
    pub routing_model: Option<String>,
    /// Time-to-live, in seconds, for a resolved `(fingerprint -> agent_id)`
    /// routing cache entry.
    #[serde(default = "default_routing_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Agent id used when routing cannot parse a confident answer from the
    /// routing model.
    pub default_agent_id: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            routing_model: None,
            cache_ttl_secs: default_routing_cache_ttl_secs(),
            default_agent_id: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    6
}
fn default_recency_bias() -> f32 {
    0.3
}
fn default_request_timeout_secs() -> u64 {
    60
}

/// One registered agent, as declared in configuration. Maps 1:1 onto the
/// `Agent` descriptor of the data model: `register_agent` consumes these at
/// startup (and via `set_mcp_server`/API calls at runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptorConfig {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Key into `Config::providers`, or empty to use `Config::model`.
    #[serde(default)]
    pub model_handle: Option<String>,
    /// MCP server ids this agent may use. Must be a subset of currently-ready
    /// servers observed by the MCP Service at call time.
    #[serde(default)]
    pub tool_scope: Vec<String>,
    /// Tool names within `tool_scope` that must be available or the turn
    /// fails with `ToolUnavailable` rather than silently proceeding without
    /// them.
    #[serde(default)]
    pub mandatory_tools: Vec<String>,
    /// Paths to knowledge-source files/directories attached to this agent.
    #[serde(default)]
    pub knowledge_paths: Vec<String>,
    /// Blend coefficient for Buffer Memory search (0 = pure semantic, 1 =
    /// pure recency).
    #[serde(default = "default_recency_bias")]
    pub recency_bias: f32,
    /// Overrides the global per-tool-invocation deadline for this agent.
    pub request_timeout_override_secs: Option<u64>,
    /// Maximum tool-call rounds before the turn fails with
    /// `ToolLoopExceeded`.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
}

impl Default for AgentDescriptorConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            name: String::new(),
            description: String::new(),
            system_prompt: String::new(),
            model_handle: None,
            tool_scope: Vec::new(),
            mandatory_tools: Vec::new(),
            knowledge_paths: Vec::new(),
            recency_bias: default_recency_bias(),
            request_timeout_override_secs: None,
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    HttpSse,
    Command,
}

/// Configuration-time rendering of `MCPServerDescriptor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub server_id: String,
    pub transport: McpTransport,
    /// SSE endpoint URL when `transport = http_sse`.
    pub endpoint: Option<String>,
    /// Executable + argv when `transport = command`.
    #[serde(default)]
    pub command_line: Vec<String>,
    /// Bearer token or similar, forwarded on every request.
    pub credentials: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// If the subprocess exits, restart it with backoff. Only meaningful for
    /// `transport = command`.
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,
}

fn default_buffer_multiplier() -> usize {
    4
}
fn default_context_window() -> usize {
    32_000
}
fn default_rebuild_every() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorMetric {
    InnerProduct,
    L2,
}

impl Default for VectorMetric {
    fn default() -> Self {
        VectorMetric::InnerProduct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Model context window, in tokens; buffer capacity is
    /// `context_window * buffer_multiplier` items (spec invariant).
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Buffer capacity multiplier (see `context_window`).
    #[serde(default = "default_buffer_multiplier")]
    pub buffer_multiplier: usize,
    /// Full ANN index rebuild cadence, in insertions.
    #[serde(default = "default_rebuild_every")]
    pub rebuild_every: usize,
    /// Distance metric used by the buffer's nearest-neighbor index.
    #[serde(default)]
    pub vector_metric: VectorMetric,
    /// Default recency bias used when an agent does not override it.
    #[serde(default = "default_recency_bias")]
    pub default_recency_bias: f32,
    /// Path to the SQLite database backing Long-Term Memory.
    #[serde(default = "MemoryConfig::default_long_term_path")]
    pub long_term_db_path: String,
    /// Default `importance` assigned to an assistant reply appended to
    /// Long-Term Memory at `finalizing` (spec default 0.5).
    #[serde(default = "MemoryConfig::default_reply_importance")]
    pub default_reply_importance: f32,
    /// Directory used to cache knowledge-source chunk embeddings.
    #[serde(default = "MemoryConfig::default_knowledge_cache_dir")]
    pub knowledge_cache_dir: String,
}

impl MemoryConfig {
    fn default_long_term_path() -> String {
        "muxi-long-term.sqlite3".into()
    }
    fn default_reply_importance() -> f32 {
        0.5
    }
    fn default_knowledge_cache_dir() -> String {
        ".muxi/knowledge-cache".into()
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            buffer_multiplier: default_buffer_multiplier(),
            rebuild_every: default_rebuild_every(),
            vector_metric: VectorMetric::default(),
            default_recency_bias: default_recency_bias(),
            long_term_db_path: Self::default_long_term_path(),
            default_reply_importance: Self::default_reply_importance(),
            knowledge_cache_dir: Self::default_knowledge_cache_dir(),
        }
    }
}

fn default_extraction_interval() -> u32 {
    1
}
fn default_confidence_threshold() -> f32 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Whether the Memory Extractor runs automatically after each turn.
    #[serde(default = "default_true")]
    pub auto_extract: bool,
    /// Run extraction on every `extraction_interval`-th turn for a user.
    #[serde(default = "default_extraction_interval")]
    pub extraction_interval: u32,
    /// Minimum confidence for an extracted fact to be persisted.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Key into `Config::providers` used for extraction calls; `None` falls
    /// back to `Config::model`.
    pub extraction_model: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            auto_extract: true,
            extraction_interval: default_extraction_interval(),
            confidence_threshold: default_confidence_threshold(),
            extraction_model: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
