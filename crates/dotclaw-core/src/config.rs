use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Floor for the total chat-handler deadline when it has to be computed.
pub const HANDLER_TIMEOUT_FLOOR_MS: u64 = 120_000;
/// Headroom added on top of the container timeout for the handler deadline.
pub const HANDLER_TIMEOUT_HEADROOM_MS: u64 = 30_000;

/// Top-level runtime config (`config.json` + `DOTCLAW_*` env overrides).
///
/// Every field carries a serde default so a partial file deep-merges over the
/// built-in defaults; unknown keys are ignored, type mismatches are load
/// errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Model used when routing has no opinion for the request.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// The tenant group allowed to write `global`-scoped memories.
    #[serde(default = "default_primary_group")]
    pub primary_group: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub background_jobs: BackgroundJobsConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Model capability catalog. Unknown models fall back to
    /// [`ModelEntry::fallback`].
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            primary_group: default_primary_group(),
            scheduler: SchedulerConfig::default(),
            container: ContainerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            memory: MemoryConfig::default(),
            background_jobs: BackgroundJobsConfig::default(),
            failover: FailoverConfig::default(),
            streaming: StreamingConfig::default(),
            progress: ProgressConfig::default(),
            maintenance: MaintenanceConfig::default(),
            tools: ToolsConfig::default(),
            models: Vec::new(),
        }
    }
}

/// Per-user / per-group model routing. User wins over group wins over
/// `routing.model` wins over `host.default_model`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    pub model: Option<String>,
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub groups: HashMap<String, String>,
    /// Failover chain tried after the resolved model, in order.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    /// Total deadline for one chat-handler pass. When unset it is computed
    /// as `max(container.timeout_ms + 30s, 120s)` so it strictly exceeds
    /// the container timeout.
    pub handler_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sched_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    #[serde(default = "default_task_retry_base_ms")]
    pub task_retry_base_ms: i64,
    #[serde(default = "default_task_retry_max_ms")]
    pub task_retry_max_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_sched_poll_ms(),
            task_max_retries: default_task_max_retries(),
            task_retry_base_ms: default_task_retry_base_ms(),
            task_retry_max_ms: default_task_retry_max_ms(),
        }
    }
}

/// Sandbox shape forwarded to the container runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_container_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default = "default_container_memory")]
    pub memory: String,
    #[serde(default = "default_container_cpus")]
    pub cpus: f64,
    #[serde(default = "bool_true")]
    pub read_only_root: bool,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    #[serde(default = "default_run_uid")]
    pub run_uid: u32,
    #[serde(default = "default_run_gid")]
    pub run_gid: u32,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_container_timeout_ms(),
            pids_limit: default_pids_limit(),
            memory: default_container_memory(),
            cpus: default_container_cpus(),
            read_only_root: true,
            tmpfs_size: default_tmpfs_size(),
            run_uid: default_run_uid(),
            run_gid: default_run_gid(),
        }
    }
}

/// Admission-control bounds for the lane semaphore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// 0 means waiters queue indefinitely; > 0 rejects after this long.
    #[serde(default)]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_lane_starvation_ms")]
    pub lane_starvation_ms: u64,
    #[serde(default = "default_max_consecutive_interactive")]
    pub max_consecutive_interactive: u32,
    /// Pre-warm a container at startup so the first request skips cold start.
    #[serde(default)]
    pub warm_start: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            queue_timeout_ms: 0,
            lane_starvation_ms: default_lane_starvation_ms(),
            max_consecutive_interactive: default_max_consecutive_interactive(),
            warm_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub maintenance: MemoryMaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_recall_max_results")]
    pub max_results: usize,
    #[serde(default = "default_recall_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_recall_min_score")]
    pub min_score: f64,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_results: default_recall_max_results(),
            max_tokens: default_recall_max_tokens(),
            min_score: default_recall_min_score(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_base_url")]
    pub base_url: String,
    /// Cosine-similarity share of the blended recall score.
    #[serde(default = "default_embed_weight")]
    pub weight: f64,
    #[serde(default = "default_embed_query_cache_ttl_ms")]
    pub query_cache_ttl_ms: i64,
    #[serde(default = "default_embed_max_candidates")]
    pub max_candidates: usize,
    /// Below this many embedded items the vector blend is skipped.
    #[serde(default = "default_embed_min_items")]
    pub min_items: usize,
    #[serde(default = "default_embed_min_query_chars")]
    pub min_query_chars: usize,
    /// Backfill indexer cadence.
    #[serde(default = "default_embed_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_embed_max_backlog")]
    pub max_backlog: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_embed_model(),
            base_url: default_embed_base_url(),
            weight: default_embed_weight(),
            query_cache_ttl_ms: default_embed_query_cache_ttl_ms(),
            max_candidates: default_embed_max_candidates(),
            min_items: default_embed_min_items(),
            min_query_chars: default_embed_min_query_chars(),
            interval_ms: default_embed_interval_ms(),
            max_backlog: default_embed_max_backlog(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMaintenanceConfig {
    #[serde(default = "default_mem_max_items")]
    pub max_items: usize,
    #[serde(default = "default_prune_importance_threshold")]
    pub prune_importance_threshold: f64,
    #[serde(default = "bool_true")]
    pub vacuum_enabled: bool,
    #[serde(default = "default_vacuum_interval_days")]
    pub vacuum_interval_days: i64,
}

impl Default for MemoryMaintenanceConfig {
    fn default() -> Self {
        Self {
            max_items: default_mem_max_items(),
            prune_importance_threshold: default_prune_importance_threshold(),
            vacuum_enabled: true,
            vacuum_interval_days: default_vacuum_interval_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJobsConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_jobs_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_jobs_max_concurrent")]
    pub max_concurrent: usize,
    /// Default wall-clock budget per job; a job row may override it.
    #[serde(default = "default_jobs_max_runtime_ms")]
    pub max_runtime_ms: u64,
    #[serde(default = "default_jobs_max_tool_steps")]
    pub max_tool_steps: u32,
    /// Results longer than this spill to a file; the chat keeps a summary.
    #[serde(default = "default_jobs_inline_max_chars")]
    pub inline_max_chars: usize,
    #[serde(default = "default_context_mode")]
    pub context_mode_default: String,
    #[serde(default)]
    pub tool_allow: Vec<String>,
    #[serde(default)]
    pub tool_deny: Vec<String>,
    /// Lease granted at claim time; expired leases are reclaimed as timed out.
    #[serde(default = "default_jobs_lease_ms")]
    pub default_lease_ms: i64,
    /// Model overrides a job may request. Empty means any model is accepted.
    #[serde(default)]
    pub model_allowlist: Vec<String>,
}

impl Default for BackgroundJobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_jobs_poll_interval_ms(),
            max_concurrent: default_jobs_max_concurrent(),
            max_runtime_ms: default_jobs_max_runtime_ms(),
            max_tool_steps: default_jobs_max_tool_steps(),
            inline_max_chars: default_jobs_inline_max_chars(),
            context_mode_default: default_context_mode(),
            tool_allow: Vec::new(),
            tool_deny: Vec::new(),
            default_lease_ms: default_jobs_lease_ms(),
            model_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_failover_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cooldown_rate_limit_ms")]
    pub cooldown_rate_limit_ms: i64,
    #[serde(default = "default_cooldown_transient_ms")]
    pub cooldown_transient_ms: i64,
    #[serde(default = "default_cooldown_invalid_response_ms")]
    pub cooldown_invalid_response_ms: i64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: default_failover_max_retries(),
            cooldown_rate_limit_ms: default_cooldown_rate_limit_ms(),
            cooldown_transient_ms: default_cooldown_transient_ms(),
            cooldown_invalid_response_ms: default_cooldown_invalid_response_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunk-directory poll cadence. Floored to 25 ms at use sites.
    #[serde(default = "default_chunk_flush_interval_ms")]
    pub chunk_flush_interval_ms: u64,
    #[serde(default = "default_edit_interval_ms")]
    pub edit_interval_ms: u64,
    #[serde(default = "default_max_edit_length")]
    pub max_edit_length: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_flush_interval_ms: default_chunk_flush_interval_ms(),
            edit_interval_ms: default_edit_interval_ms(),
            max_edit_length: default_max_edit_length(),
        }
    }
}

/// Progress pings sent to the chat while a background job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_progress_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_progress_max_updates")]
    pub max_updates: u32,
    #[serde(default = "default_progress_messages")]
    pub messages: Vec<String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay_ms: default_progress_start_delay_ms(),
            interval_ms: default_progress_interval_ms(),
            max_updates: default_progress_max_updates(),
            messages: default_progress_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_maintenance_interval_ms")]
    pub interval_ms: u64,
    /// Trace-file retention in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_job_retention_ms")]
    pub job_retention_ms: i64,
    #[serde(default = "default_task_log_retention_ms")]
    pub task_log_retention_ms: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_maintenance_interval_ms(),
            retention_days: default_retention_days(),
            job_retention_ms: default_job_retention_ms(),
            task_log_retention_ms: default_task_log_retention_ms(),
        }
    }
}

/// One layer of the tool policy. `allow = None` means the layer has no
/// opinion on the allowlist; `deny` always unions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyLayer {
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub default: PolicyLayer,
    #[serde(default)]
    pub groups: HashMap<String, PolicyLayer>,
    #[serde(default)]
    pub users: HashMap<String, PolicyLayer>,
    /// Per-run invocation budgets, keyed by tool name.
    #[serde(default)]
    pub budgets: HashMap<String, u32>,
}

/// Capability row for one model in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_max_completion_tokens")]
    pub max_completion_tokens: usize,
}

impl ModelEntry {
    /// Capabilities assumed for models missing from the catalog.
    pub fn fallback(id: &str) -> Self {
        Self {
            id: id.to_string(),
            context_length: default_context_length(),
            max_completion_tokens: default_max_completion_tokens(),
        }
    }
}

impl RuntimeConfig {
    /// Load config from a JSON file with `DOTCLAW_*` env var overrides.
    ///
    /// Missing file is fine — defaults apply. A present-but-invalid file is
    /// a hard error so a typo cannot silently run with defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RuntimeConfig = Figment::new()
            .merge(Json::file(&path))
            .merge(Env::prefixed("DOTCLAW_").split("_"))
            .extract()
            .map_err(|e| crate::error::DotclawError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Deadline for one full chat-handler pass. Strictly exceeds the
    /// container timeout so the container always gets to report first.
    pub fn effective_handler_timeout_ms(&self) -> u64 {
        self.telegram.handler_timeout_ms.unwrap_or_else(|| {
            (self.host.container.timeout_ms + HANDLER_TIMEOUT_HEADROOM_MS)
                .max(HANDLER_TIMEOUT_FLOOR_MS)
        })
    }
}

fn default_config_path() -> String {
    let home = std::env::var("DOTCLAW_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.dotclaw")
    });
    format!("{home}/config/config.json")
}

fn bool_true() -> bool {
    true
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_primary_group() -> String {
    "main".to_string()
}
fn default_sched_poll_ms() -> u64 {
    60_000
}
fn default_task_max_retries() -> u32 {
    3
}
fn default_task_retry_base_ms() -> i64 {
    30_000
}
fn default_task_retry_max_ms() -> i64 {
    3_600_000
}
fn default_container_timeout_ms() -> u64 {
    600_000
}
fn default_pids_limit() -> u32 {
    256
}
fn default_container_memory() -> String {
    "2g".to_string()
}
fn default_container_cpus() -> f64 {
    2.0
}
fn default_tmpfs_size() -> String {
    "256m".to_string()
}
fn default_run_uid() -> u32 {
    1000
}
fn default_run_gid() -> u32 {
    1000
}
fn default_max_agents() -> usize {
    3
}
fn default_lane_starvation_ms() -> u64 {
    45_000
}
fn default_max_consecutive_interactive() -> u32 {
    4
}
fn default_recall_max_results() -> usize {
    12
}
fn default_recall_max_tokens() -> usize {
    2_000
}
fn default_recall_min_score() -> f64 {
    0.05
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embed_base_url() -> String {
    "http://127.0.0.1:8090".to_string()
}
fn default_embed_weight() -> f64 {
    0.6
}
fn default_embed_query_cache_ttl_ms() -> i64 {
    60_000
}
fn default_embed_max_candidates() -> usize {
    200
}
fn default_embed_min_items() -> usize {
    8
}
fn default_embed_min_query_chars() -> usize {
    6
}
fn default_embed_interval_ms() -> u64 {
    30_000
}
fn default_embed_max_backlog() -> usize {
    512
}
fn default_mem_max_items() -> usize {
    5_000
}
fn default_prune_importance_threshold() -> f64 {
    0.25
}
fn default_vacuum_interval_days() -> i64 {
    7
}
fn default_jobs_poll_interval_ms() -> u64 {
    1_500
}
fn default_jobs_max_concurrent() -> usize {
    2
}
fn default_jobs_max_runtime_ms() -> u64 {
    900_000
}
fn default_jobs_max_tool_steps() -> u32 {
    40
}
fn default_jobs_inline_max_chars() -> usize {
    8_000
}
fn default_context_mode() -> String {
    "group".to_string()
}
fn default_jobs_lease_ms() -> i64 {
    600_000
}
fn default_failover_max_retries() -> u32 {
    3
}
fn default_cooldown_rate_limit_ms() -> i64 {
    120_000
}
fn default_cooldown_transient_ms() -> i64 {
    300_000
}
fn default_cooldown_invalid_response_ms() -> i64 {
    600_000
}
fn default_chunk_flush_interval_ms() -> u64 {
    150
}
fn default_edit_interval_ms() -> u64 {
    1_500
}
fn default_max_edit_length() -> usize {
    3_900
}
fn default_progress_start_delay_ms() -> u64 {
    20_000
}
fn default_progress_interval_ms() -> u64 {
    45_000
}
fn default_progress_max_updates() -> u32 {
    3
}
fn default_progress_messages() -> Vec<String> {
    vec![
        "Still working on it…".to_string(),
        "Making progress, hang tight.".to_string(),
        "This one is taking a while — still on it.".to_string(),
    ]
}
fn default_maintenance_interval_ms() -> u64 {
    21_600_000
}
fn default_retention_days() -> i64 {
    14
}
fn default_job_retention_ms() -> i64 {
    7 * 24 * 3_600_000
}
fn default_task_log_retention_ms() -> i64 {
    14 * 24 * 3_600_000
}
fn default_context_length() -> usize {
    200_000
}
fn default_max_completion_tokens() -> usize {
    8_192
}
