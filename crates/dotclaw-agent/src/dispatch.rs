//! Container dispatch: admission, failover, and streaming for one agent run.
//!
//! The dispatch loop walks the model chain: acquire a lane slot (unless the
//! caller enforces its own concurrency), run the container, and on a
//! retryable failure register a cooldown, downgrade effort and tool budget,
//! and move to the next eligible model. Streaming runs are watched
//! concurrently and their partial message is cleaned up on failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use dotclaw_core::config::{ContainerConfig, FailoverConfig, StreamingConfig};
use dotclaw_core::port::{
    ChatPort, ContainerRequest, ContainerRunner, ContainerStatus, Lane, ReasoningEffort,
    SandboxSpec,
};

use crate::error::{AgentError, Result};
use crate::failover::{
    choose_next_model, classify_error, cooldown_duration_ms, CooldownRegistry, FailoverEnvelope,
};
use crate::semaphore::LaneSemaphore;
use crate::stream::{ChunkEvent, ChunkWatcher, StreamDelivery};

/// How long to keep waiting for a sentinel after the container has already
/// exited cleanly.
const SENTINEL_WAIT: Duration = Duration::from_secs(2);

/// One agent run to dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub group: String,
    pub chat_id: String,
    pub user_id: Option<String>,
    pub prompt: String,
    pub session_id: Option<String>,
    pub lane: Lane,
    /// The background-job engine bounds its own concurrency and passes
    /// false; everything else goes through the lane semaphore.
    pub use_semaphore: bool,
    /// Primary model first, then fallbacks.
    pub model_chain: Vec<String>,
    pub reasoning_effort: ReasoningEffort,
    pub max_tool_steps: u32,
    pub tool_allow: Option<Vec<String>>,
    pub tool_deny: Vec<String>,
    /// When set, the container streams chunk files here and partial output
    /// is delivered to the chat as in-place edits.
    pub stream_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    pub trace_id: String,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: String,
    pub model: String,
    pub attempts: u32,
}

/// Binds the semaphore, cooldown registry, container runner, and chat port
/// into the one dispatch path every lane uses.
pub struct AgentService {
    semaphore: Arc<LaneSemaphore>,
    cooldowns: Arc<CooldownRegistry>,
    runner: Arc<dyn ContainerRunner>,
    chat: Arc<dyn ChatPort>,
    failover: FailoverConfig,
    streaming: StreamingConfig,
    container: ContainerConfig,
}

impl AgentService {
    pub fn new(
        semaphore: Arc<LaneSemaphore>,
        cooldowns: Arc<CooldownRegistry>,
        runner: Arc<dyn ContainerRunner>,
        chat: Arc<dyn ChatPort>,
        failover: FailoverConfig,
        streaming: StreamingConfig,
        container: ContainerConfig,
    ) -> Self {
        Self {
            semaphore,
            cooldowns,
            runner,
            chat,
            failover,
            streaming,
            container,
        }
    }

    pub fn semaphore(&self) -> &Arc<LaneSemaphore> {
        &self.semaphore
    }

    pub fn cooldowns(&self) -> &Arc<CooldownRegistry> {
        &self.cooldowns
    }

    /// Run one agent request to completion across the model chain.
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome> {
        let _permit = if req.use_semaphore {
            Some(self.semaphore.acquire(req.lane).await?)
        } else {
            None
        };

        let mut attempted: Vec<String> = Vec::new();
        let mut effort = req.reasoning_effort;
        let mut tool_steps = req.max_tool_steps;
        let mut last_error = String::from("no model attempted");

        for attempt in 1..=self.failover.max_retries.max(1) {
            let now = Utc::now().timestamp_millis();
            let Some((model, fallbacks)) =
                choose_next_model(&req.model_chain, &attempted, &self.cooldowns, now)
            else {
                warn!(trace_id = %req.trace_id, "model chain exhausted");
                return Err(AgentError::NoModelAvailable(last_error));
            };

            let container_req = ContainerRequest {
                group: req.group.clone(),
                chat_id: req.chat_id.clone(),
                user_id: req.user_id.clone(),
                prompt: req.prompt.clone(),
                session_id: req.session_id.clone(),
                model: model.clone(),
                reasoning_effort: effort,
                max_tool_steps: tool_steps,
                tool_allow: req.tool_allow.clone(),
                tool_deny: req.tool_deny.clone(),
                stream_dir: req.stream_dir.clone(),
                timeout_ms: req.timeout_ms,
                sandbox: SandboxSpec::from(&self.container),
                trace_id: req.trace_id.clone(),
            };

            match self.run_once(&req, container_req).await {
                Ok(result) => {
                    info!(
                        trace_id = %req.trace_id,
                        %model,
                        attempt,
                        "agent run succeeded"
                    );
                    return Ok(DispatchOutcome {
                        result,
                        model,
                        attempts: attempt,
                    });
                }
                Err(message) => {
                    let envelope =
                        FailoverEnvelope::new("container", attempt, Some(&model), &message, now);
                    warn!(
                        trace_id = %req.trace_id,
                        category = %envelope.category,
                        retryable = envelope.retryable,
                        %model,
                        attempt,
                        "agent run failed: {}",
                        envelope.message
                    );

                    let cooldown = cooldown_duration_ms(envelope.category, &self.failover);
                    if cooldown > 0 {
                        self.cooldowns.note_cooldown(&model, now + cooldown, now);
                    }
                    last_error = message;

                    if !envelope.retryable || fallbacks.is_empty() {
                        return Err(AgentError::RunFailed(last_error));
                    }
                    attempted.push(model);
                    effort = effort.downgrade();
                    tool_steps = crate::failover::downgrade_tool_steps(tool_steps);
                }
            }
        }
        Err(AgentError::RunFailed(last_error))
    }

    /// One container attempt; streaming runs deliver chunks concurrently.
    /// Returns the result text or the raw error message.
    async fn run_once(
        &self,
        req: &DispatchRequest,
        container_req: ContainerRequest,
    ) -> std::result::Result<String, String> {
        match &req.stream_dir {
            None => self.consume_output(self.runner.run(container_req).await),
            Some(dir) => {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    return Err(format!("cannot create stream dir: {e}"));
                }
                let mut watcher = ChunkWatcher::new(
                    dir.clone(),
                    Duration::from_millis(self.streaming.chunk_flush_interval_ms),
                );
                let mut delivery = StreamDelivery::new(
                    Arc::clone(&self.chat),
                    &req.chat_id,
                    Duration::from_millis(self.streaming.edit_interval_ms),
                    self.streaming.max_edit_length,
                );

                let run = self.runner.run(container_req);
                tokio::pin!(run);
                let mut container_result: Option<std::result::Result<String, String>> = None;
                let streamed: std::result::Result<(), String> = loop {
                    if container_result.is_none() {
                        tokio::select! {
                            event = watcher.next_event() => match event {
                                Ok(ChunkEvent::Text(text)) => delivery.push(&text).await,
                                Ok(ChunkEvent::Done) => break Ok(()),
                                Ok(ChunkEvent::Error(e)) => break Err(e),
                                Err(e) => break Err(e.to_string()),
                            },
                            out = &mut run => match self.consume_output(out) {
                                // A failed container writes no sentinel —
                                // stop watching right away.
                                Err(e) => {
                                    delivery.cleanup().await;
                                    return Err(e);
                                }
                                Ok(result) => container_result = Some(Ok(result)),
                            },
                        }
                    } else {
                        // The container already exited ok; drain what it
                        // left behind, bounded in case the sentinel never
                        // materialises.
                        match tokio::time::timeout(SENTINEL_WAIT, watcher.next_event()).await {
                            Ok(Ok(ChunkEvent::Text(text))) => delivery.push(&text).await,
                            Ok(Ok(ChunkEvent::Done)) => break Ok(()),
                            Ok(Ok(ChunkEvent::Error(e))) => break Err(e),
                            Ok(Err(e)) => break Err(e.to_string()),
                            Err(_) => break Ok(()),
                        }
                    }
                };

                match streamed {
                    Ok(()) => {
                        let full = delivery.finalize().await;
                        // Prefer the container's explicit result; fall back
                        // to the streamed text when it reports none.
                        let result = match container_result {
                            Some(Ok(r)) if !r.is_empty() => r,
                            Some(Ok(_)) => full,
                            Some(Err(e)) => return Err(e),
                            None => match run.await {
                                Ok(out) if out.status == ContainerStatus::Ok => out
                                    .result
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or(full),
                                Ok(out) => {
                                    return Err(out
                                        .error
                                        .unwrap_or_else(|| "container error".to_string()))
                                }
                                Err(e) => return Err(e.to_string()),
                            },
                        };
                        Ok(result)
                    }
                    Err(e) => {
                        delivery.cleanup().await;
                        Err(e)
                    }
                }
            }
        }
    }

    fn consume_output(
        &self,
        out: std::result::Result<dotclaw_core::port::ContainerOutput, dotclaw_core::port::PortError>,
    ) -> std::result::Result<String, String> {
        match out {
            Ok(out) => match out.status {
                ContainerStatus::Ok => Ok(out.result.unwrap_or_default()),
                ContainerStatus::Error => {
                    Err(out.error.unwrap_or_else(|| "container error".to_string()))
                }
            },
            Err(e) => Err(e.to_string()),
        }
    }

    /// Category-aware helper for callers reporting a dispatch failure.
    pub fn classify(&self, error: &AgentError) -> crate::failover::ErrorCategory {
        match error {
            AgentError::RunFailed(msg) | AgentError::NoModelAvailable(msg) => classify_error(msg),
            AgentError::QueueTimeout { .. } => crate::failover::ErrorCategory::Timeout,
            _ => crate::failover::ErrorCategory::NonRetryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dotclaw_core::port::{ContainerOutput, MessageRef, PortError};
    use std::sync::Mutex;

    struct SilentChat;

    #[async_trait]
    impl ChatPort for SilentChat {
        async fn send_message(
            &self,
            _chat_id: &str,
            _text: &str,
        ) -> std::result::Result<MessageRef, PortError> {
            Ok(MessageRef("m".to_string()))
        }
        async fn edit_message(
            &self,
            _chat_id: &str,
            _message: &MessageRef,
            _text: &str,
        ) -> std::result::Result<(), PortError> {
            Ok(())
        }
        async fn delete_message(
            &self,
            _chat_id: &str,
            _message: &MessageRef,
        ) -> std::result::Result<(), PortError> {
            Ok(())
        }
        async fn send_file(
            &self,
            _chat_id: &str,
            _path: &std::path::Path,
            _caption: Option<&str>,
        ) -> std::result::Result<(), PortError> {
            Ok(())
        }
    }

    /// Per-model scripted container: model → outcome.
    struct ScriptedRunner {
        calls: Mutex<Vec<(String, ReasoningEffort, u32)>>,
        fail_models: Vec<(String, String)>,
    }

    #[async_trait]
    impl ContainerRunner for ScriptedRunner {
        async fn run(
            &self,
            req: ContainerRequest,
        ) -> std::result::Result<ContainerOutput, PortError> {
            self.calls.lock().unwrap().push((
                req.model.clone(),
                req.reasoning_effort,
                req.max_tool_steps,
            ));
            if let Some((_, err)) = self.fail_models.iter().find(|(m, _)| *m == req.model) {
                return Ok(ContainerOutput {
                    status: ContainerStatus::Error,
                    result: None,
                    error: Some(err.clone()),
                });
            }
            Ok(ContainerOutput {
                status: ContainerStatus::Ok,
                result: Some(format!("answer from {}", req.model)),
                error: None,
            })
        }
    }

    fn service(fail_models: Vec<(String, String)>) -> (AgentService, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner {
            calls: Mutex::new(Vec::new()),
            fail_models,
        });
        let semaphore = Arc::new(LaneSemaphore::new(crate::semaphore::SemaphoreConfig {
            limit: 2,
            queue_timeout: Duration::ZERO,
            lane_starvation: Duration::from_millis(500),
            max_consecutive_interactive: 5,
        }));
        let service = AgentService::new(
            semaphore,
            Arc::new(CooldownRegistry::new(None)),
            runner.clone(),
            Arc::new(SilentChat),
            FailoverConfig::default(),
            StreamingConfig::default(),
            ContainerConfig::default(),
        );
        (service, runner)
    }

    fn request(chain: &[&str]) -> DispatchRequest {
        DispatchRequest {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            user_id: None,
            prompt: "hi".to_string(),
            session_id: None,
            lane: Lane::Interactive,
            use_semaphore: true,
            model_chain: chain.iter().map(|s| s.to_string()).collect(),
            reasoning_effort: ReasoningEffort::High,
            max_tool_steps: 40,
            tool_allow: None,
            tool_deny: Vec::new(),
            stream_dir: None,
            timeout_ms: 60_000,
            trace_id: "t1".to_string(),
        }
    }

    #[tokio::test]
    async fn failover_walks_the_chain_with_downgrades() {
        let (service, runner) = service(vec![(
            "model-a".to_string(),
            "503 overloaded".to_string(),
        )]);

        let out = service.dispatch(request(&["model-a", "model-b"])).await.unwrap();
        assert_eq!(out.model, "model-b");
        assert_eq!(out.attempts, 2);
        assert_eq!(out.result, "answer from model-b");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], ("model-a".to_string(), ReasoningEffort::High, 40));
        // Second attempt runs downgraded: effort one step down, 70% steps.
        assert_eq!(calls[1], ("model-b".to_string(), ReasoningEffort::Medium, 28));

        // The failed model is now cooling.
        let now = Utc::now().timestamp_millis();
        assert!(service.cooldowns().is_cooling("model-a", now));
        assert!(!service.cooldowns().is_cooling("model-b", now));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_the_chain() {
        let (service, runner) = service(vec![(
            "model-a".to_string(),
            "401 unauthorized".to_string(),
        )]);

        let err = service
            .dispatch(request(&["model-a", "model-b"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RunFailed(_)));
        // The fallback was never consulted for an auth failure.
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
        // Auth failures do not cool the model down.
        let now = Utc::now().timestamp_millis();
        assert!(!service.cooldowns().is_cooling("model-a", now));
    }

    #[tokio::test]
    async fn cooled_models_are_skipped_at_selection() {
        let (service, runner) = service(Vec::new());
        let now = Utc::now().timestamp_millis();
        service
            .cooldowns()
            .note_cooldown("model-a", now + 600_000, now);

        let out = service.dispatch(request(&["model-a", "model-b"])).await.unwrap();
        assert_eq!(out.model, "model-b");
        assert_eq!(out.attempts, 1);
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_no_model() {
        let (service, _runner) = service(Vec::new());
        let now = Utc::now().timestamp_millis();
        service.cooldowns().note_cooldown("model-a", now + 600_000, now);

        let err = service.dispatch(request(&["model-a"])).await.unwrap_err();
        assert!(matches!(err, AgentError::NoModelAvailable(_)));
    }

    #[tokio::test]
    async fn streaming_run_delivers_and_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        // Container that writes chunks then the done sentinel.
        struct StreamingRunner;
        #[async_trait]
        impl ContainerRunner for StreamingRunner {
            async fn run(
                &self,
                req: ContainerRequest,
            ) -> std::result::Result<ContainerOutput, PortError> {
                let dir = req.stream_dir.unwrap();
                std::fs::write(dir.join("chunk_000001.txt"), "part one ").unwrap();
                std::fs::write(dir.join("chunk_000002.txt"), "part two").unwrap();
                std::fs::write(dir.join("done"), "").unwrap();
                Ok(ContainerOutput {
                    status: ContainerStatus::Ok,
                    result: None,
                    error: None,
                })
            }
        }

        let service = AgentService::new(
            Arc::new(LaneSemaphore::new(crate::semaphore::SemaphoreConfig {
                limit: 1,
                queue_timeout: Duration::ZERO,
                lane_starvation: Duration::from_millis(500),
                max_consecutive_interactive: 5,
            })),
            Arc::new(CooldownRegistry::new(None)),
            Arc::new(StreamingRunner),
            Arc::new(SilentChat),
            FailoverConfig::default(),
            StreamingConfig {
                chunk_flush_interval_ms: 25,
                ..StreamingConfig::default()
            },
            ContainerConfig::default(),
        );

        let mut req = request(&["model-a"]);
        req.stream_dir = Some(dir.path().join("run1"));
        let out = service.dispatch(req).await.unwrap();
        assert_eq!(out.result, "part one part two");
    }
}
