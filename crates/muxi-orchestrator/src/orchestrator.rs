// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Orchestrator: the single process-wide coordinator that wires every
//! subsystem from `Config` and exposes `chat` and its surrounding
//! agent/memory/tool-server management API.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use muxi_config::{AgentDescriptorConfig, Config, McpServerConfig};
use muxi_core::{
    spawn_extraction, run_turn, AgentDescriptor, TurnDeps, TurnEvent, TurnInput, TurnLimits, TurnOutcome,
};
use muxi_knowledge::{KnowledgeHit, KnowledgeSource};
use muxi_mcp::{CancelToken, McpService};
use muxi_memory::{
    BufferMemory, Filter as BufferFilter, LongTermFilter, LongTermStore, Memobase, PutOutcome, Source,
    SqliteLongTermStore, UserContextEntry,
};
use muxi_model::ModelProvider;

use crate::errors::OrchestratorError;
use crate::routing::Router;

/// One registered agent: its descriptor plus the model it was bound to at
/// registration time (spec §3: `model_handle` resolves to a provider
/// instance once, not per turn).
pub struct AgentEntry {
    pub descriptor: Arc<AgentDescriptor>,
    pub model: Arc<dyn ModelProvider>,
}

/// Which memory tier(s) `search_memory` should consult (spec §4.1
/// `search_memory(... scope ∈ buffer|long_term|both ...)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    Buffer,
    LongTerm,
    Both,
}

#[derive(Debug, Clone)]
pub struct MemorySearchHit {
    pub content: String,
    pub score: f32,
    pub source: &'static str,
}

/// Everything one `chat` call needs beyond the message itself.
pub struct ChatRequest<'a> {
    pub message: &'a str,
    pub user_id: u64,
    /// Pins routing to this agent directly (spec §4.1 "If `agent_id` is
    /// supplied, used directly").
    pub agent_id: Option<&'a str>,
    pub conversation_id: Option<&'a str>,
    pub stream_sink: tokio::sync::mpsc::Sender<TurnEvent>,
    pub cancel: CancelToken,
}

/// Single process-wide coordinator (spec §4.1). Cheap to hold behind an
/// `Arc`; every field here is itself internally synchronized, matching
/// spec §5's "Shared-resource policy".
pub struct Orchestrator {
    config: Arc<Config>,
    agents: RwLock<Vec<Arc<AgentEntry>>>,
    router: Router,
    mcp: Arc<McpService>,
    buffer: Arc<BufferMemory>,
    long_term: Option<Arc<dyn LongTermStore>>,
    memobase: Arc<Memobase>,
    default_model: Arc<dyn ModelProvider>,
    routing_model: Option<Arc<dyn ModelProvider>>,
    extraction_model: Arc<dyn ModelProvider>,
    limits: TurnLimits,
    turn_counts: RwLock<HashMap<u64, u32>>,
    /// Detached extraction tasks, tracked only so `shutdown` can drain them
    /// with best-effort grace (spec §4.7 "Orchestrator shutdown cancels
    /// pending extractions with best-effort grace").
    extraction_tasks: AsyncMutex<JoinSet<usize>>,
}

impl Orchestrator {
    /// Build every subsystem from `config` (spec §4.1 ambient additions):
    /// model providers, the MCP Service with its configured servers
    /// registered, the memory stack, the Routing Engine, and every
    /// statically declared agent.
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let default_model: Arc<dyn ModelProvider> = Arc::from(muxi_model::from_config(&config.model)?);

        let routing_model = match &config.routing.routing_model {
            Some(handle) => Some(Self::resolve_provider(&config, handle)?),
            None => None,
        };
        let extraction_model = match &config.extraction.extraction_model {
            Some(handle) => Self::resolve_provider(&config, handle)?,
            None => default_model.clone(),
        };

        let mcp = Arc::new(McpService::new());
        for server in &config.mcp_servers {
            mcp.register(server).map_err(|e| anyhow::anyhow!("registering MCP server `{}`: {e}", server.server_id))?;
        }

        let buffer = Arc::new(BufferMemory::from_config(&config.memory));

        let long_term: Option<Arc<dyn LongTermStore>> =
            match SqliteLongTermStore::open(&config.memory.long_term_db_path, config.model.embedding_dimension) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(error = %e, "long-term memory unavailable at startup, degrading to buffer+context only");
                    None
                }
            };

        let memobase = Arc::new(Memobase::new());
        let router = Router::new(&config.routing);
        let limits = TurnLimits { reply_importance: config.memory.default_reply_importance, ..TurnLimits::default() };

        let orchestrator = Self {
            config: config.clone(),
            agents: RwLock::new(Vec::new()),
            router,
            mcp,
            buffer,
            long_term,
            memobase,
            default_model,
            routing_model,
            extraction_model,
            limits,
            turn_counts: RwLock::new(HashMap::new()),
            extraction_tasks: AsyncMutex::new(JoinSet::new()),
        };

        for agent_cfg in &config.agents {
            orchestrator.register_agent(agent_cfg.clone()).await?;
        }

        Ok(orchestrator)
    }

    fn resolve_provider(config: &Config, handle: &str) -> anyhow::Result<Arc<dyn ModelProvider>> {
        let cfg = config
            .providers
            .get(handle)
            .ok_or_else(|| anyhow::anyhow!("no provider named `{handle}` in `providers`"))?;
        Ok(Arc::from(muxi_model::from_config(cfg)?))
    }

    /// Register (or re-register, replacing the prior entry) one agent. A
    /// knowledge load failure is logged and the agent is still registered
    /// without that source — knowledge is an enrichment, not a dependency
    /// the agent otherwise needs to function.
    pub async fn register_agent(&self, cfg: AgentDescriptorConfig) -> Result<String, OrchestratorError> {
        let model = match &cfg.model_handle {
            Some(handle) => Self::resolve_provider(&self.config, handle).map_err(|e| OrchestratorError::ModelFailed(e.to_string()))?,
            None => self.default_model.clone(),
        };

        let mut descriptor = AgentDescriptor::from_config(&cfg);
        if !cfg.knowledge_paths.is_empty() {
            let cache_dir = format!("{}/{}", self.config.memory.knowledge_cache_dir, descriptor.agent_id);
            let source = KnowledgeSource::new(descriptor.agent_id.clone(), cache_dir);
            match source.load(&cfg.knowledge_paths, model.as_ref(), self.config.model.embedding_dimension).await {
                Ok(()) => descriptor.knowledge.push(source),
                Err(e) => tracing::warn!(agent_id = %descriptor.agent_id, error = %e, "knowledge source failed to load, registering agent without it"),
            }
        }

        let agent_id = descriptor.agent_id.clone();
        let entry = Arc::new(AgentEntry { descriptor: Arc::new(descriptor), model });

        let mut guard = self.agents.write().expect("agent registry lock poisoned");
        guard.retain(|e| e.descriptor.agent_id != agent_id);
        guard.push(entry);
        Ok(agent_id)
    }

    /// Deregister an agent. Turns already in flight hold their own `Arc`
    /// clone of the entry from the moment `chat` resolved it, so they run
    /// to completion unaffected (spec §4.1 "existing turns complete").
    pub fn remove_agent(&self, agent_id: &str) {
        let mut guard = self.agents.write().expect("agent registry lock poisoned");
        guard.retain(|e| e.descriptor.agent_id != agent_id);
    }

    fn agents_snapshot(&self) -> Vec<Arc<AgentEntry>> {
        self.agents.read().expect("agent registry lock poisoned").clone()
    }

    fn find_agent(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.read().expect("agent registry lock poisoned").iter().find(|e| e.descriptor.agent_id == agent_id).cloned()
    }

    /// The entry point (spec §4.1 `chat`). Resolves routing, runs the Turn
    /// Pipeline, and triggers detached extraction on success.
    pub async fn chat(&self, req: ChatRequest<'_>) -> Result<TurnOutcome, OrchestratorError> {
        let agents = self.agents_snapshot();
        if agents.is_empty() {
            return Err(OrchestratorError::NoAgents);
        }

        let agent_id = match req.agent_id {
            Some(id) => id.to_string(),
            None => self
                .router
                .select_agent(req.message, &agents, self.routing_model.as_deref().map(|m| m as &dyn ModelProvider))
                .await
                .ok_or(OrchestratorError::RoutingFailed)?,
        };

        let entry = self.find_agent(&agent_id).ok_or_else(|| OrchestratorError::UnknownAgent(agent_id.clone()))?;

        let long_term = self.long_term.as_deref();
        let deps =
            TurnDeps { model: entry.model.as_ref(), mcp: &self.mcp, buffer: &self.buffer, long_term, memobase: &self.memobase };
        let input = TurnInput { message: req.message, user_id: req.user_id, conversation_id: req.conversation_id };

        let outcome = run_turn(&entry.descriptor, deps, input, req.stream_sink, req.cancel, self.limits)
            .await
            .map_err(OrchestratorError::from_turn_error)?;

        self.maybe_extract(req.user_id, req.message, &outcome.reply, entry.model.clone()).await;

        Ok(outcome)
    }

    /// Spawn a detached extraction task if the policy in `Config::extraction`
    /// says this turn qualifies (spec §4.2 point 6).
    async fn maybe_extract(&self, user_id: u64, message: &str, reply: &str, model: Arc<dyn ModelProvider>) {
        if !self.config.extraction.auto_extract || user_id == 0 {
            return;
        }

        let turn_count = {
            let mut guard = self.turn_counts.write().expect("turn counter lock poisoned");
            let count = guard.entry(user_id).or_insert(0);
            *count += 1;
            *count
        };
        if turn_count % self.config.extraction.extraction_interval.max(1) != 0 {
            return;
        }

        let model = if Arc::ptr_eq(&model, &self.default_model) { self.extraction_model.clone() } else { model };
        let handle = spawn_extraction(
            model,
            self.memobase.clone(),
            user_id,
            message.to_string(),
            reply.to_string(),
            self.config.extraction.confidence_threshold,
        );
        let mut tasks = self.extraction_tasks.lock().await;
        tasks.spawn(async move { handle.await.unwrap_or(0) });
    }

    /// Drain outstanding extraction tasks with a bounded grace period
    /// (spec §4.7 "best-effort grace"), aborting whatever remains after.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = self.extraction_tasks.lock().await;
        let _ = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        tasks.abort_all();
    }

    /// Search Buffer and/or Long-Term Memory directly (spec §4.1
    /// `search_memory`), outside of a turn.
    pub async fn search_memory(
        &self,
        query: &str,
        scope: MemoryScope,
        user_id: u64,
        limit: usize,
        recency_bias: f32,
    ) -> Result<Vec<MemorySearchHit>, OrchestratorError> {
        let query_embedding = self.default_model.embed(&[query.to_string()]).await.ok().and_then(|mut v| {
            if v.is_empty() {
                None
            } else {
                Some(v.remove(0))
            }
        });

        let mut hits = Vec::new();

        if matches!(scope, MemoryScope::Buffer | MemoryScope::Both) {
            let filter = BufferFilter { user_id: Some(user_id), agent_id: None, conversation_id: None };
            hits.extend(
                self.buffer
                    .search(query_embedding.as_deref(), limit, &filter, recency_bias)
                    .into_iter()
                    .map(|h| MemorySearchHit { content: h.content, score: h.score, source: "buffer" }),
            );
        }

        if matches!(scope, MemoryScope::LongTerm | MemoryScope::Both) {
            if let (Some(store), Some(embedding)) = (&self.long_term, &query_embedding) {
                let filter = LongTermFilter { user_id: Some(user_id), agent_id: None };
                match store.search(embedding, limit, filter).await {
                    Ok(found) => hits.extend(found.into_iter().map(|h| MemorySearchHit {
                        content: h.record.content,
                        score: h.score,
                        source: "long_term",
                    })),
                    Err(e) => {
                        tracing::warn!(error = %e, "long-term memory search failed, returning buffer-only results");
                        if scope == MemoryScope::LongTerm {
                            return Err(OrchestratorError::MemoryUnavailable(e.to_string()));
                        }
                    }
                }
            } else if scope == MemoryScope::LongTerm {
                return Err(OrchestratorError::MemoryUnavailable("long-term memory is not configured".into()));
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Search one agent's attached knowledge sources directly (spec §4.9).
    pub async fn search_knowledge(&self, agent_id: &str, query: &str, top_k: usize, threshold: f32) -> Vec<KnowledgeHit> {
        let Some(entry) = self.find_agent(agent_id) else {
            return Vec::new();
        };
        let Ok(mut embeddings) = entry.model.embed(&[query.to_string()]).await else {
            return Vec::new();
        };
        if embeddings.is_empty() {
            return Vec::new();
        }
        let query_embedding = embeddings.remove(0);
        entry
            .descriptor
            .knowledge
            .iter()
            .flat_map(|source| source.search(&query_embedding, top_k, threshold))
            .collect()
    }

    pub fn add_user_context(&self, user_id: u64, key: impl Into<String>, value: serde_json::Value, importance: f32, source: Source) -> PutOutcome {
        self.memobase.put(user_id, key, value, importance, source)
    }

    pub fn get_user_context(&self, user_id: u64) -> Vec<(String, UserContextEntry)> {
        self.memobase.get(user_id)
    }

    pub fn set_mcp_server(&self, descriptor: &McpServerConfig) -> Result<(), OrchestratorError> {
        self.mcp.register(descriptor).map_err(|e| OrchestratorError::ToolUnavailable(e.to_string()))
    }

    pub fn remove_mcp_server(&self, server_id: &str) {
        self.mcp.close(server_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
