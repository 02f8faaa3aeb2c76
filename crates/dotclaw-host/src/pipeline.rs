//! The interactive request path, plus the adapters that let the scheduler
//! and the job engine execute agent runs through the same dispatch.
//!
//! Control flow per request: ingest → cursor advance → turn hygiene →
//! context build → acquire(interactive) → container dispatch with streaming
//! → telemetry and audit. On failure the error is classified, the model
//! cooled down (inside dispatch), a trace envelope written, and the chat
//! receives one humanized line.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use dotclaw_agent::{
    AgentService, ContextBuilder, ContextRequest, DispatchRequest, FailoverEnvelope,
};
use dotclaw_core::config::RuntimeConfig;
use dotclaw_core::paths::InstallPaths;
use dotclaw_core::port::{ChatPort, ContainerRunner, Lane, ReasoningEffort};
use dotclaw_jobs::{BackgroundJob, JobExecutor};
use dotclaw_memory::{EmbeddingClient, MemoryStore};
use dotclaw_scheduler::{ScheduledTask, TaskRunner};
use dotclaw_store::{ChatStore, NewMessage, ToolAuditEntry};

use crate::hygiene::apply_turn_hygiene;

/// Composition root for one running host process.
pub struct Host {
    cfg: RuntimeConfig,
    paths: InstallPaths,
    chat_store: Arc<ChatStore>,
    builder: Arc<ContextBuilder>,
    service: Arc<AgentService>,
    chat: Arc<dyn ChatPort>,
}

impl Host {
    pub fn new(
        cfg: RuntimeConfig,
        paths: InstallPaths,
        chat_store: Arc<ChatStore>,
        memory: Arc<MemoryStore>,
        runner: Arc<dyn ContainerRunner>,
        chat: Arc<dyn ChatPort>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
    ) -> Self {
        let semaphore = Arc::new(dotclaw_agent::LaneSemaphore::new(
            dotclaw_agent::SemaphoreConfig::from_concurrency(&cfg.host.concurrency),
        ));
        let cooldowns = Arc::new(dotclaw_agent::CooldownRegistry::new(Some(
            paths.data_dir.join("model_cooldowns.json"),
        )));
        let service = Arc::new(AgentService::new(
            semaphore,
            cooldowns,
            runner,
            Arc::clone(&chat),
            cfg.host.failover.clone(),
            cfg.host.streaming.clone(),
            cfg.host.container.clone(),
        ));
        let builder = Arc::new(ContextBuilder::new(
            cfg.clone(),
            memory,
            Arc::clone(&chat_store),
            embedder,
        ));
        Self {
            cfg,
            paths,
            chat_store,
            builder,
            service,
            chat,
        }
    }

    pub fn service(&self) -> &Arc<AgentService> {
        &self.service
    }

    pub fn builder(&self) -> &Arc<ContextBuilder> {
        &self.builder
    }

    /// Adapter the scheduler engine runs due tasks through.
    pub fn task_runner(&self) -> Arc<TaskRunnerAdapter> {
        Arc::new(TaskRunnerAdapter {
            cfg: self.cfg.clone(),
            builder: Arc::clone(&self.builder),
            service: Arc::clone(&self.service),
        })
    }

    /// Adapter the background-job engine executes claims through.
    pub fn job_executor(&self) -> Arc<JobExecutorAdapter> {
        Arc::new(JobExecutorAdapter {
            cfg: self.cfg.clone(),
            builder: Arc::clone(&self.builder),
            service: Arc::clone(&self.service),
            chat_store: Arc::clone(&self.chat_store),
            paths: self.paths.clone(),
        })
    }

    /// Pre-warm a container when configured so the first interactive
    /// request skips the cold start. Best-effort.
    pub async fn warm_up(&self) {
        if !self.cfg.host.concurrency.warm_start {
            return;
        }
        let model = self
            .builder
            .registry()
            .resolve(&self.cfg.host.primary_group, None);
        let request = DispatchRequest {
            group: self.cfg.host.primary_group.clone(),
            chat_id: String::new(),
            user_id: None,
            prompt: "ping".to_string(),
            session_id: None,
            lane: Lane::Maintenance,
            use_semaphore: true,
            model_chain: vec![model.id],
            reasoning_effort: ReasoningEffort::Low,
            max_tool_steps: 8,
            tool_allow: Some(Vec::new()),
            tool_deny: Vec::new(),
            stream_dir: None,
            timeout_ms: self.cfg.host.container.timeout_ms,
            trace_id: format!("warm-{}", Uuid::new_v4()),
        };
        match self.service.dispatch(request).await {
            Ok(_) => info!("container warm start complete"),
            Err(e) => warn!("container warm start failed: {e}"),
        }
    }

    /// Handle one incoming batch for a chat. Returns the agent's reply text
    /// (already streamed to the chat), or `None` when hygiene left nothing
    /// to answer.
    pub async fn handle_messages(
        &self,
        group: &str,
        chat_id: &str,
        user_id: Option<&str>,
        batch: Vec<NewMessage>,
    ) -> Option<String> {
        if let Err(e) = self.chat_store.record_messages(&batch) {
            warn!(chat_id, "message persistence failed: {e}");
        }

        let cursor = match self.chat_store.cursor(chat_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(chat_id, "cursor load failed: {e}");
                return None;
            }
        };
        let pending = match self.chat_store.messages_since(chat_id, &cursor) {
            Ok(p) => p,
            Err(e) => {
                warn!(chat_id, "since-query failed: {e}");
                return None;
            }
        };
        if pending.is_empty() {
            return None;
        }

        // The cursor covers everything we have seen, including messages
        // hygiene drops — they must not come back on the next poll.
        if let Some(last) = pending.last() {
            if let Err(e) = self
                .chat_store
                .advance_cursor(chat_id, last.ts, &last.msg_id)
            {
                warn!(chat_id, "cursor advance failed: {e}");
            }
        }

        let turn = apply_turn_hygiene(pending.into_iter().map(NewMessage::from).collect());
        if turn.is_empty() {
            return None;
        }

        let recall_query = turn.last().map(|m| m.body.clone()).unwrap_or_default();
        let prompt = render_turn(&turn);
        let started = Utc::now().timestamp_millis();
        let trace_id = Uuid::new_v4().to_string();

        let ctx = self
            .builder
            .build(
                &ContextRequest {
                    group: group.to_string(),
                    user_id: user_id.map(str::to_string),
                    recall_query,
                    recall_enabled: true,
                    ..ContextRequest::default()
                },
                started,
            )
            .await;

        let request = DispatchRequest {
            group: group.to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.map(str::to_string),
            prompt,
            session_id: None,
            lane: Lane::Interactive,
            use_semaphore: true,
            model_chain: self
                .builder
                .registry()
                .chain_from(&ctx.model.id, &self.cfg.routing.fallbacks),
            reasoning_effort: ReasoningEffort::High,
            max_tool_steps: self.cfg.host.background_jobs.max_tool_steps,
            tool_allow: ctx.tool_policy.allow.clone(),
            tool_deny: ctx.tool_policy.deny.clone(),
            stream_dir: Some(self.paths.ipc_dir.join(&trace_id)),
            timeout_ms: self.cfg.host.container.timeout_ms,
            trace_id: trace_id.clone(),
        };

        let handler_timeout =
            std::time::Duration::from_millis(self.cfg.effective_handler_timeout_ms());
        let outcome =
            match tokio::time::timeout(handler_timeout, self.service.dispatch(request)).await {
                Ok(result) => result,
                Err(_) => Err(dotclaw_agent::AgentError::RunFailed(format!(
                    "handler timed out after {}ms",
                    handler_timeout.as_millis()
                ))),
            };
        let duration_ms = Utc::now().timestamp_millis() - started;

        match outcome {
            Ok(outcome) => {
                info!(
                    chat_id,
                    trace_id,
                    model = %outcome.model,
                    attempts = outcome.attempts,
                    duration_ms,
                    context_build_ms = ctx.timings.context_build_ms,
                    "interactive request served"
                );
                self.record_reply(group, chat_id, &trace_id, &outcome.result);
                self.audit_run(group, chat_id, user_id, &trace_id, true, duration_ms, None);
                Some(outcome.result)
            }
            Err(err) => {
                let category = self.service.classify(&err);
                let raw = err.to_string();
                let envelope =
                    FailoverEnvelope::new("handler", 1, Some(&ctx.model.id), &raw, started);
                self.write_trace(&trace_id, &envelope);

                let friendly = dotclaw_agent::humanize_error(&raw, category);
                match dotclaw_agent::severity(category) {
                    dotclaw_agent::Severity::Warn => {
                        warn!(chat_id, trace_id, category = %category, "request failed: {raw}")
                    }
                    dotclaw_agent::Severity::Info => {
                        info!(chat_id, trace_id, category = %category, "request ended: {raw}")
                    }
                    dotclaw_agent::Severity::Error => {
                        tracing::error!(chat_id, trace_id, category = %category, "request failed: {raw}")
                    }
                }
                if let Err(e) = self.chat.send_message(chat_id, &friendly).await {
                    warn!(chat_id, "failure notice delivery failed: {e}");
                }
                self.audit_run(
                    group,
                    chat_id,
                    user_id,
                    &trace_id,
                    false,
                    duration_ms,
                    Some(&raw),
                );
                None
            }
        }
    }

    /// Store the bot's reply so it lands in history with `from_self` set.
    fn record_reply(&self, _group: &str, chat_id: &str, trace_id: &str, text: &str) {
        let now = Utc::now().timestamp_millis();
        let msg = NewMessage {
            msg_id: format!("bot-{trace_id}"),
            chat_id: chat_id.to_string(),
            sender_id: "dotclaw".to_string(),
            sender_name: "dotclaw".to_string(),
            body: text.to_string(),
            ts: now,
            from_self: true,
        };
        if let Err(e) = self.chat_store.record_messages(std::slice::from_ref(&msg)) {
            warn!(chat_id, "reply persistence failed: {e}");
        }
    }

    /// Audit insertions never propagate.
    #[allow(clippy::too_many_arguments)]
    fn audit_run(
        &self,
        group: &str,
        chat_id: &str,
        user_id: Option<&str>,
        trace_id: &str,
        ok: bool,
        duration_ms: i64,
        error: Option<&str>,
    ) {
        let entry = ToolAuditEntry {
            trace_id: trace_id.to_string(),
            chat_id: Some(chat_id.to_string()),
            group: group.to_string(),
            user_id: user_id.map(str::to_string),
            tool_name: "agent_run".to_string(),
            ok,
            duration_ms,
            error: error.map(str::to_string),
            created_at: Utc::now().timestamp_millis(),
            source: Some("interactive".to_string()),
        };
        if let Err(e) = self.chat_store.record_tool_audit(&entry) {
            warn!(trace_id, "audit insert failed: {e}");
        }
    }

    /// The trace file keeps the technical envelope; the chat only ever sees
    /// the humanized line.
    fn write_trace(&self, trace_id: &str, envelope: &FailoverEnvelope) {
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.paths.traces_dir)?;
            let path = self.paths.traces_dir.join(format!("{trace_id}.json"));
            std::fs::write(path, serde_json::to_vec_pretty(envelope)?)
        };
        if let Err(e) = write() {
            warn!(trace_id, "trace write failed: {e}");
        }
    }
}

fn render_turn(turn: &[NewMessage]) -> String {
    turn.iter()
        .map(|m| {
            if m.sender_name.is_empty() {
                m.body.clone()
            } else {
                format!("{}: {}", m.sender_name, m.body)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs due scheduled tasks through the agent dispatch on the scheduled
/// lane.
pub struct TaskRunnerAdapter {
    cfg: RuntimeConfig,
    builder: Arc<ContextBuilder>,
    service: Arc<AgentService>,
}

#[async_trait]
impl TaskRunner for TaskRunnerAdapter {
    async fn run_task(&self, task: &ScheduledTask) -> std::result::Result<String, String> {
        let now = Utc::now().timestamp_millis();
        let ctx = self
            .builder
            .build(
                &ContextRequest {
                    group: task.group.clone(),
                    user_id: None,
                    recall_query: task.prompt.clone(),
                    recall_enabled: true,
                    ..ContextRequest::default()
                },
                now,
            )
            .await;

        let request = DispatchRequest {
            group: task.group.clone(),
            chat_id: task.chat_id.clone(),
            user_id: None,
            prompt: task.prompt.clone(),
            session_id: None,
            lane: Lane::Scheduled,
            use_semaphore: true,
            model_chain: self
                .builder
                .registry()
                .chain_from(&ctx.model.id, &self.cfg.routing.fallbacks),
            reasoning_effort: ReasoningEffort::Medium,
            max_tool_steps: self.cfg.host.background_jobs.max_tool_steps,
            tool_allow: ctx.tool_policy.allow.clone(),
            tool_deny: ctx.tool_policy.deny.clone(),
            stream_dir: None,
            timeout_ms: self.cfg.host.container.timeout_ms,
            trace_id: format!("task-{}", task.id),
        };
        self.service
            .dispatch(request)
            .await
            .map(|outcome| outcome.result)
            .map_err(|e| e.to_string())
    }
}

/// Executes background jobs (and orchestration aggregation calls). The job
/// engine bounds its own concurrency, so these runs skip the semaphore.
pub struct JobExecutorAdapter {
    cfg: RuntimeConfig,
    builder: Arc<ContextBuilder>,
    service: Arc<AgentService>,
    chat_store: Arc<ChatStore>,
    paths: InstallPaths,
}

impl JobExecutorAdapter {
    /// Session handle for the run. Isolated jobs get a snapshot copy of the
    /// group's live session; group-context jobs share it directly.
    fn resolve_session(&self, job: &BackgroundJob) -> Option<String> {
        let live = self.chat_store.group_session(&job.group).ok().flatten()?;
        if job.context_mode != "isolated" {
            return Some(live.session_id);
        }
        match dotclaw_store::snapshot::snapshot_session(
            &self.paths.sessions_dir,
            &job.group,
            &live.session_id,
        ) {
            Ok(dir) => dir
                .file_name()
                .map(|n| format!("snapshots/{}", n.to_string_lossy())),
            Err(e) => {
                warn!(job_id = %job.id, "session snapshot failed, running detached: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl JobExecutor for JobExecutorAdapter {
    async fn execute(
        &self,
        job: &BackgroundJob,
        cancel: CancellationToken,
    ) -> std::result::Result<Option<String>, String> {
        let now = Utc::now().timestamp_millis();
        let jobs_cfg = &self.cfg.host.background_jobs;
        let ctx = self
            .builder
            .build(
                &ContextRequest {
                    group: job.group.clone(),
                    user_id: None,
                    recall_query: job.prompt.clone(),
                    recall_enabled: true,
                    tool_allow: (!jobs_cfg.tool_allow.is_empty())
                        .then(|| jobs_cfg.tool_allow.clone()),
                    tool_deny: jobs_cfg.tool_deny.clone(),
                    ..ContextRequest::default()
                },
                now,
            )
            .await;

        // A validated override leads the chain; the resolved model and the
        // configured fallbacks still back it up.
        let mut chain = Vec::new();
        if let Some(ref model) = job.model_override {
            chain.push(model.clone());
        }
        chain.push(ctx.model.id.clone());
        chain.extend(self.cfg.routing.fallbacks.iter().cloned());

        let request = DispatchRequest {
            group: job.group.clone(),
            chat_id: job.chat_id.clone(),
            user_id: None,
            prompt: job.prompt.clone(),
            session_id: self.resolve_session(job),
            lane: Lane::Scheduled,
            use_semaphore: false,
            model_chain: chain,
            reasoning_effort: ReasoningEffort::Medium,
            max_tool_steps: job
                .max_tool_steps
                .unwrap_or(self.cfg.host.background_jobs.max_tool_steps),
            tool_allow: ctx.tool_policy.allow.clone(),
            tool_deny: ctx.tool_policy.deny.clone(),
            stream_dir: None,
            timeout_ms: job
                .timeout_ms
                .map(|t| t as u64)
                .unwrap_or(self.cfg.host.background_jobs.max_runtime_ms),
            trace_id: job
                .parent_trace_id
                .clone()
                .unwrap_or_else(|| format!("job-{}", job.id)),
        };

        tokio::select! {
            _ = cancel.cancelled() => Err("canceled".to_string()),
            result = self.service.dispatch(request) => result
                .map(|outcome| Some(outcome.result))
                .map_err(|e| e.to_string()),
        }
    }

    async fn run_oneshot(
        &self,
        group: &str,
        prompt: &str,
    ) -> std::result::Result<String, String> {
        let now = Utc::now().timestamp_millis();
        let ctx = self
            .builder
            .build(
                &ContextRequest {
                    group: group.to_string(),
                    recall_query: String::new(),
                    recall_enabled: false,
                    ..ContextRequest::default()
                },
                now,
            )
            .await;

        let request = DispatchRequest {
            group: group.to_string(),
            chat_id: String::new(),
            user_id: None,
            prompt: prompt.to_string(),
            session_id: None,
            lane: Lane::Scheduled,
            use_semaphore: false,
            model_chain: self
                .builder
                .registry()
                .chain_from(&ctx.model.id, &self.cfg.routing.fallbacks),
            reasoning_effort: ReasoningEffort::Low,
            max_tool_steps: 8,
            tool_allow: ctx.tool_policy.allow.clone(),
            tool_deny: ctx.tool_policy.deny.clone(),
            stream_dir: None,
            timeout_ms: self.cfg.host.container.timeout_ms,
            trace_id: format!("oneshot-{}", Uuid::new_v4()),
        };
        self.service
            .dispatch(request)
            .await
            .map(|outcome| outcome.result)
            .map_err(|e| e.to_string())
    }
}
