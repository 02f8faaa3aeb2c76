//! Per-request agent context assembly.
//!
//! One request in, one [`AgentContext`] out: resolved model and
//! capabilities, dynamic memory budget, hybrid recall, user profile,
//! memory stats, behavior config, effective tool policy, tool reliability,
//! and timing instrumentation. Degradable steps (recall, profile, stats,
//! reliability) log and continue so a memory hiccup never blocks a reply.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use dotclaw_core::config::{ModelEntry, RuntimeConfig};
use dotclaw_memory::{BehaviorConfig, EmbeddingClient, MemoryStats, MemoryStore, RecallRequest};
use dotclaw_store::{ChatStore, ToolReliability};

use crate::policy::{effective_tool_policy, ToolPolicy};
use crate::registry::{ModelRegistry, ResolvedModel};

/// Budget share of the usable context window given to memory recall.
const MEMORY_BUDGET_SHARE: f64 = 0.15;
/// Bounds on the computed recall budget, in tokens.
const MEMORY_BUDGET_MIN: usize = 800;
const MEMORY_BUDGET_MAX: usize = 4_000;
/// Sliding window of audit rows feeding tool reliability.
const RELIABILITY_WINDOW: u32 = 200;
/// Profile lines surfaced per request.
const PROFILE_TOP_K: usize = 8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextTimings {
    pub context_build_ms: u64,
    pub memory_recall_ms: u64,
}

/// Everything the container dispatch needs for one request. Lives for a
/// single handoff; never persisted.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub memory_recall: Vec<String>,
    pub user_profile: Vec<String>,
    pub memory_stats: MemoryStats,
    pub behavior: BehaviorConfig,
    pub tool_policy: ToolPolicy,
    pub tool_reliability: Vec<ToolReliability>,
    pub model: ResolvedModel,
    pub capabilities: ModelEntry,
    pub dynamic_memory_budget: usize,
    pub timings: ContextTimings,
}

#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub group: String,
    pub user_id: Option<String>,
    pub recall_query: String,
    pub recall_max_results: Option<usize>,
    pub recall_max_tokens: Option<usize>,
    pub tool_allow: Option<Vec<String>>,
    pub tool_deny: Vec<String>,
    /// Background paths leave this off to skip recall entirely.
    pub recall_enabled: bool,
}

pub struct ContextBuilder {
    cfg: RuntimeConfig,
    registry: ModelRegistry,
    memory: Arc<MemoryStore>,
    chat_store: Arc<ChatStore>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
}

impl ContextBuilder {
    pub fn new(
        cfg: RuntimeConfig,
        memory: Arc<MemoryStore>,
        chat_store: Arc<ChatStore>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
    ) -> Self {
        Self {
            registry: ModelRegistry::from_config(&cfg),
            cfg,
            memory,
            chat_store,
            embedder,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Assemble the context for one request.
    pub async fn build(&self, req: &ContextRequest, now: i64) -> AgentContext {
        let build_start = Instant::now();
        let group = req.group.as_str();
        let user_id = req.user_id.as_deref();

        let model = self.registry.resolve(group, user_id);
        let capabilities = self.registry.capabilities(&model.id);

        let usable = capabilities
            .context_length
            .saturating_sub(capabilities.max_completion_tokens);
        let mut budget =
            ((usable as f64 * MEMORY_BUDGET_SHARE) as usize).clamp(MEMORY_BUDGET_MIN, MEMORY_BUDGET_MAX);
        if let Some(cap) = req.recall_max_tokens {
            budget = budget.min(cap);
        }

        let mut memory_recall = Vec::new();
        let mut recall_ms = 0u64;
        let max_results = req
            .recall_max_results
            .unwrap_or(self.cfg.host.memory.recall.max_results);
        if req.recall_enabled && budget > 0 && max_results > 0 && !req.recall_query.is_empty() {
            let recall_start = Instant::now();
            let recall_req = RecallRequest {
                group: group.to_string(),
                user_id: req.user_id.clone(),
                query: req.recall_query.clone(),
                max_results,
                max_tokens: budget,
                min_score: self.cfg.host.memory.recall.min_score,
            };
            match self
                .memory
                .hybrid_recall(
                    &recall_req,
                    self.embedder.as_deref(),
                    &self.cfg.host.memory.embeddings,
                    now,
                )
                .await
            {
                Ok(outcome) => {
                    debug!(
                        group,
                        hits = outcome.lines.len(),
                        tokens = outcome.estimated_tokens,
                        "memory recall"
                    );
                    memory_recall = outcome.lines;
                }
                Err(e) => warn!(group, "memory recall failed: {e}"),
            }
            recall_ms = recall_start.elapsed().as_millis() as u64;
        }

        let user_profile = match user_id {
            Some(user) => self
                .memory
                .user_profile(group, user, PROFILE_TOP_K)
                .unwrap_or_else(|e| {
                    warn!(group, "profile load failed: {e}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let memory_stats = self.memory.stats(group).unwrap_or_else(|e| {
            warn!(group, "memory stats failed: {e}");
            MemoryStats::default()
        });

        let behavior = self
            .memory
            .behavior_config(group, user_id, now)
            .unwrap_or_else(|e| {
                warn!(group, "behavior config failed: {e}");
                BehaviorConfig::default()
            });

        let tool_policy = effective_tool_policy(
            &self.cfg.host.tools,
            group,
            user_id,
            req.tool_allow.as_deref(),
            &req.tool_deny,
        );

        let tool_reliability = self
            .chat_store
            .tool_reliability(group, RELIABILITY_WINDOW)
            .unwrap_or_else(|e| {
                warn!(group, "tool reliability failed: {e}");
                Vec::new()
            });

        AgentContext {
            memory_recall,
            user_profile,
            memory_stats,
            behavior,
            tool_policy,
            tool_reliability,
            model,
            capabilities,
            dynamic_memory_budget: budget,
            timings: ContextTimings {
                context_build_ms: build_start.elapsed().as_millis() as u64,
                memory_recall_ms: recall_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotclaw_memory::{MemoryScope, MemoryType, MemoryUpsert};
    use rusqlite::Connection;

    fn builder(cfg: RuntimeConfig) -> ContextBuilder {
        let memory =
            Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap(), "main").unwrap());
        let chat_store =
            Arc::new(ChatStore::new(Connection::open_in_memory().unwrap()).unwrap());
        ContextBuilder::new(cfg, memory, chat_store, None)
    }

    fn request() -> ContextRequest {
        ContextRequest {
            group: "main".to_string(),
            user_id: Some("alice".to_string()),
            recall_query: "deploy checklist".to_string(),
            recall_enabled: true,
            ..ContextRequest::default()
        }
    }

    fn catalog_entry(id: &str, context_length: usize, max_completion: usize) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            context_length,
            max_completion_tokens: max_completion,
        }
    }

    #[tokio::test]
    async fn budget_follows_capabilities_and_caller_cap() {
        let mut cfg = RuntimeConfig::default();
        cfg.host.default_model = "m".to_string();
        // usable = 100_000 - 4_000; 15% = 14_400 → clamped to 4_000.
        cfg.host.models.push(catalog_entry("m", 100_000, 4_000));
        let b = builder(cfg);

        let ctx = b.build(&request(), 1_000).await;
        assert_eq!(ctx.dynamic_memory_budget, 4_000);

        // Tiny model: 15% of (10_000 - 4_000) = 900.
        let mut cfg = RuntimeConfig::default();
        cfg.host.default_model = "tiny".to_string();
        cfg.host.models.push(catalog_entry("tiny", 10_000, 4_000));
        let ctx = builder(cfg).build(&request(), 1_000).await;
        assert_eq!(ctx.dynamic_memory_budget, 900);

        // Caller cap wins when smaller.
        let mut req = request();
        req.recall_max_tokens = Some(500);
        let mut cfg = RuntimeConfig::default();
        cfg.host.default_model = "m".to_string();
        cfg.host.models.push(catalog_entry("m", 100_000, 4_000));
        let ctx = builder(cfg).build(&req, 1_000).await;
        assert_eq!(ctx.dynamic_memory_budget, 500);
    }

    #[tokio::test]
    async fn recall_lines_fit_the_budget() {
        let cfg = RuntimeConfig::default();
        let b = builder(cfg);
        for i in 0..20 {
            b.memory
                .upsert_batch(
                    "main",
                    &[MemoryUpsert {
                        scope: MemoryScope::Group,
                        subject_id: None,
                        mem_type: MemoryType::Fact,
                        kind: None,
                        conflict_key: None,
                        content: format!("deploy checklist item number {i} with details"),
                        importance: 0.6,
                        confidence: 0.8,
                        tags: Vec::new(),
                        ttl_days: None,
                        source: None,
                        metadata: None,
                    }],
                    500,
                )
                .unwrap();
        }

        let mut req = request();
        req.recall_max_tokens = Some(40);
        let ctx = b.build(&req, 1_000).await;
        assert!(!ctx.memory_recall.is_empty());
        let total: usize = ctx
            .memory_recall
            .iter()
            .map(|l| l.len().div_ceil(4))
            .sum();
        assert!(total <= 40);
        assert!(ctx.timings.context_build_ms >= ctx.timings.memory_recall_ms);
    }

    #[tokio::test]
    async fn disabled_recall_skips_memory_entirely() {
        let b = builder(RuntimeConfig::default());
        let mut req = request();
        req.recall_enabled = false;
        let ctx = b.build(&req, 1_000).await;
        assert!(ctx.memory_recall.is_empty());
        assert_eq!(ctx.timings.memory_recall_ms, 0);
    }

    #[tokio::test]
    async fn policy_and_model_resolution_flow_through() {
        let mut cfg = RuntimeConfig::default();
        cfg.routing
            .users
            .insert("alice".to_string(), "model-alice".to_string());
        cfg.host
            .tools
            .groups
            .insert("main".to_string(), dotclaw_core::config::PolicyLayer {
                allow: Some(vec!["bash".to_string()]),
                deny: vec![],
            });
        let b = builder(cfg);

        let ctx = b.build(&request(), 1_000).await;
        assert_eq!(ctx.model.id, "model-alice");
        assert!(ctx.tool_policy.allows("bash"));
        assert!(!ctx.tool_policy.allows("web"));
    }
}
