use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dotclaw_core::config::{BackgroundJobsConfig, ProgressConfig};
use dotclaw_core::port::ChatPort;

use crate::error::Result;
use crate::store::{CancelOutcome, JobStore};
use crate::types::{BackgroundJob, JobStatus, NewJob};

/// Error text that resolves a failed run to `timed_out` instead of `failed`.
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed out|timeout").unwrap());
/// Tag carrying a user-supplied ETA for progress pings, e.g. `eta:2.5`.
static ETA_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^eta:(\d+(\.\d+)?)$").unwrap());

/// Executes one claimed job (and one-shot aggregation calls) against the
/// agent dispatch path. The engine enforces its own concurrency, so
/// implementations run without the lane semaphore or group lock.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the job's agent pass. `Ok` carries the result text; `Err` the
    /// failure message. Implementations should return promptly once
    /// `cancel` fires.
    async fn execute(
        &self,
        job: &BackgroundJob,
        cancel: CancellationToken,
    ) -> std::result::Result<Option<String>, String>;

    /// Single non-streaming agent call, used by orchestration aggregation.
    async fn run_oneshot(
        &self,
        group: &str,
        prompt: &str,
    ) -> std::result::Result<String, String>;
}

/// Background-job engine: lease sweep, atomic claim, runner lifecycle,
/// progress pings, result truncation, and completion delivery.
pub struct JobEngine {
    store: Arc<JobStore>,
    executor: Arc<dyn JobExecutor>,
    chat: Arc<dyn ChatPort>,
    /// Root of per-group workspaces, for result spill files.
    groups_dir: PathBuf,
    cfg: BackgroundJobsConfig,
    progress: ProgressConfig,
    /// Live runners by job id. The cancel path consults it; at most one
    /// token ever exists per job id.
    inflight: DashMap<String, CancellationToken>,
}

enum RunOutcome {
    Done(Option<String>),
    Failed(String),
    Aborted,
    TimedOut(u64),
}

impl JobEngine {
    pub fn new(
        store: Arc<JobStore>,
        executor: Arc<dyn JobExecutor>,
        chat: Arc<dyn ChatPort>,
        groups_dir: PathBuf,
        cfg: BackgroundJobsConfig,
        progress: ProgressConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            chat,
            groups_dir,
            cfg,
            progress,
            inflight: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn JobExecutor> {
        &self.executor
    }

    /// Enqueue a job, applying the engine's context-mode default and model
    /// allowlist.
    pub fn enqueue(&self, input: &NewJob) -> Result<BackgroundJob> {
        self.store.enqueue(
            input,
            &self.cfg.context_mode_default,
            &self.cfg.model_allowlist,
            Utc::now().timestamp_millis(),
        )
    }

    /// Cancel a job: terminal rows are a no-op; otherwise the row flips to
    /// `canceled` and any live runner is aborted.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(id, Utc::now().timestamp_millis())?;
        if let Some((_, token)) = self.inflight.remove(id) {
            token.cancel();
        }
        Ok(outcome)
    }

    /// Main poll loop. Runs until `shutdown` broadcasts true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.enabled {
            info!("background-job engine disabled");
            return;
        }
        info!(
            poll_ms = self.cfg.poll_interval_ms,
            max_concurrent = self.cfg.max_concurrent,
            "background-job engine started"
        );
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.cfg.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("job engine tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("background-job engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One poll pass: keep live leases fresh, sweep expired ones, then
    /// claim up to the concurrency budget. Returns how many jobs were
    /// claimed this pass.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now().timestamp_millis();

        // Runners in this process are alive by definition — re-extend their
        // leases before sweeping so the sweep only reaps orphaned rows.
        for entry in self.inflight.iter() {
            let _ = self
                .store
                .extend_lease(entry.key(), now + self.cfg.default_lease_ms);
        }
        for id in self.store.expire_leases(now)? {
            warn!(job_id = %id, "job lease expired, reclaimed as timed_out");
        }

        let mut claimed = 0usize;
        while self.inflight.len() < self.cfg.max_concurrent {
            let Some(job) = self.store.claim_next(now, self.cfg.default_lease_ms)? else {
                break;
            };
            claimed += 1;
            // Register the token here, not in the runner task, so this loop
            // observes its own claims and cannot overshoot the budget.
            let token = CancellationToken::new();
            self.inflight.insert(job.id.clone(), token.clone());
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.run_claimed(job, token).await });
        }
        Ok(claimed)
    }

    async fn run_claimed(self: Arc<Self>, job: BackgroundJob, token: CancellationToken) {
        let progress = self.spawn_progress(&job, token.child_token());

        let timeout_ms = job
            .timeout_ms
            .filter(|t| *t > 0)
            .map(|t| t as u64)
            .unwrap_or(self.cfg.max_runtime_ms);

        let outcome = tokio::select! {
            _ = token.cancelled() => RunOutcome::Aborted,
            r = self.executor.execute(&job, token.child_token()) => match r {
                Ok(text) => RunOutcome::Done(text),
                Err(e) => RunOutcome::Failed(e),
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                token.cancel();
                RunOutcome::TimedOut(timeout_ms)
            }
        };

        if let Some(handle) = progress {
            handle.abort();
        }
        self.inflight.remove(&job.id);
        let now = Utc::now().timestamp_millis();

        let (status, summary, output_path, truncated, last_error) = match outcome {
            RunOutcome::Aborted => (JobStatus::Canceled, None, None, false, None),
            RunOutcome::TimedOut(ms) => (
                JobStatus::TimedOut,
                None,
                None,
                false,
                Some(format!("timed out after {ms}ms")),
            ),
            RunOutcome::Failed(e) => {
                let status = if TIMEOUT_RE.is_match(&e) {
                    JobStatus::TimedOut
                } else {
                    JobStatus::Failed
                };
                (status, None, None, false, Some(e))
            }
            RunOutcome::Done(text) => {
                let text = text.unwrap_or_default().trim().to_string();
                match self.spill_result(&job, &text) {
                    Ok((summary, path, truncated)) => {
                        (JobStatus::Succeeded, summary, path, truncated, None)
                    }
                    Err(e) => (
                        JobStatus::Failed,
                        None,
                        None,
                        false,
                        Some(format!("failed to persist result: {e}")),
                    ),
                }
            }
        };

        // The transition only happens if the row is still running — an
        // intervening cancel (or lease sweep) wins and suppresses delivery.
        let transitioned = match self.store.finish(
            &job.id,
            status,
            summary.as_deref(),
            output_path.as_deref(),
            truncated,
            last_error.as_deref(),
            now,
        ) {
            Ok(t) => t,
            Err(e) => {
                error!(job_id = %job.id, "failed to persist job result: {e}");
                return;
            }
        };
        if !transitioned {
            return;
        }

        let duration_ms = now - job.started_at.unwrap_or(now);
        info!(job_id = %job.id, status = %status, duration_ms, "job finished");

        let message = completion_message(
            &job.id,
            status,
            duration_ms,
            output_path.as_deref(),
            summary.as_deref(),
        );
        // Chat delivery is best-effort; the durable row is the source of truth.
        if let Err(e) = self.chat.send_message(&job.chat_id, &message).await {
            warn!(job_id = %job.id, "completion message delivery failed: {e}");
        }
    }

    /// Write oversized results to `<group>/jobs/<id>/output.md`, keeping a
    /// capped inline summary. Returns `(summary, output_path, truncated)`.
    fn spill_result(
        &self,
        job: &BackgroundJob,
        text: &str,
    ) -> std::io::Result<(Option<String>, Option<String>, bool)> {
        if text.is_empty() {
            return Ok((None, None, false));
        }
        if text.len() <= self.cfg.inline_max_chars {
            return Ok((Some(text.to_string()), None, false));
        }
        let rel = format!("jobs/{}/output.md", job.id);
        let full = self.groups_dir.join(&job.group).join(&rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, text)?;
        let cap = self.cfg.inline_max_chars.min(1000);
        Ok((Some(truncate_str(text, cap)), Some(rel), true))
    }

    fn spawn_progress(
        &self,
        job: &BackgroundJob,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.progress.enabled || self.progress.max_updates == 0 {
            return None;
        }
        let cfg = self.progress.clone();
        let chat = Arc::clone(&self.chat);
        let chat_id = job.chat_id.clone();
        let job_id = job.id.clone();
        let eta = eta_from_tags(&job.tags);

        Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_millis(cfg.start_delay_ms)) => {}
            }
            for i in 0..cfg.max_updates {
                let base = cfg
                    .messages
                    .get(i as usize % cfg.messages.len().max(1))
                    .cloned()
                    .unwrap_or_else(|| "Still working on it…".to_string());
                let text = match eta {
                    Some(minutes) => format!("{base} (eta: {minutes} min)"),
                    None => base,
                };
                if let Err(e) = chat.send_message(&chat_id, &text).await {
                    warn!(job_id = %job_id, "progress ping failed: {e}");
                }
                if i + 1 < cfg.max_updates {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(
                            std::time::Duration::from_millis(cfg.interval_ms)) => {}
                    }
                }
            }
        }))
    }
}

/// The chat-facing completion message. Blocks are joined by a blank line
/// with empty blocks omitted.
pub fn completion_message(
    job_id: &str,
    status: JobStatus,
    duration_ms: i64,
    output_path: Option<&str>,
    summary: Option<&str>,
) -> String {
    let mut blocks = vec![
        format!("Background job {job_id} {status}."),
        format!("Duration: {}s.", ((duration_ms as f64) / 1000.0).round() as i64),
    ];
    if let Some(path) = output_path {
        blocks.push(format!("Output saved to: {path}"));
    }
    if let Some(summary) = summary {
        if !summary.is_empty() {
            blocks.push(format!("Summary:\n{summary}"));
        }
    }
    blocks.join("\n\n")
}

/// First `eta:<number>` tag, interpreted as minutes.
fn eta_from_tags(tags: &[String]) -> Option<f64> {
    tags.iter().find_map(|t| {
        ETA_TAG_RE
            .captures(t)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotclaw_core::port::{MessageRef, PortError};
    use rusqlite::Connection;
    use std::sync::Mutex;

    pub(crate) struct RecordingChat {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChat {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatPort for RecordingChat {
        async fn send_message(
            &self,
            chat_id: &str,
            text: &str,
        ) -> std::result::Result<MessageRef, PortError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id.to_string(), text.to_string()));
            Ok(MessageRef(format!("m{}", sent.len())))
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

    enum Script {
        Reply(String),
        Fail(String),
        SleepForever,
    }

    struct ScriptedExecutor(Script);

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _job: &BackgroundJob,
            cancel: CancellationToken,
        ) -> std::result::Result<Option<String>, String> {
            match &self.0 {
                Script::Reply(text) => Ok(Some(text.clone())),
                Script::Fail(e) => Err(e.clone()),
                Script::SleepForever => {
                    cancel.cancelled().await;
                    Err("canceled".to_string())
                }
            }
        }

        async fn run_oneshot(
            &self,
            _group: &str,
            prompt: &str,
        ) -> std::result::Result<String, String> {
            Ok(format!("aggregated: {} chars", prompt.len()))
        }
    }

    fn test_engine(
        script: Script,
        groups_dir: PathBuf,
        tweak: impl FnOnce(&mut BackgroundJobsConfig),
    ) -> (Arc<JobEngine>, Arc<RecordingChat>) {
        let store = Arc::new(JobStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let chat = RecordingChat::new();
        let mut cfg = BackgroundJobsConfig::default();
        tweak(&mut cfg);
        let progress = ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        };
        let engine = JobEngine::new(
            store,
            Arc::new(ScriptedExecutor(script)),
            chat.clone(),
            groups_dir,
            cfg,
            progress,
        );
        (engine, chat)
    }

    async fn run_until_terminal(engine: &Arc<JobEngine>, id: &str) -> BackgroundJob {
        for _ in 0..200 {
            engine.tick().await.unwrap();
            let job = engine.store().get(id).unwrap();
            if job.status.is_terminal() && !engine.inflight.contains_key(id) {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    fn new_job(prompt: &str) -> NewJob {
        NewJob {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            prompt: prompt.to_string(),
            ..NewJob::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_succeeds_with_events_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, chat) = test_engine(
            Script::Reply("all done".to_string()),
            dir.path().to_path_buf(),
            |_| {},
        );
        let job = engine.enqueue(&new_job("x")).unwrap();

        let done = run_until_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result_summary.as_deref(), Some("all done"));
        assert!(done.lease_expires_at.is_none());
        assert!(done.finished_at.is_some());
        assert!(!done.output_truncated);

        let messages: Vec<_> = engine
            .store()
            .events(&job.id)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, ["queued", "started", "completed"]);

        let sent = chat.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0]
            .1
            .starts_with(&format!("Background job {} succeeded.", job.id)));
        assert!(sent[0].1.contains("Summary:\nall done"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runner_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _chat) =
            test_engine(Script::SleepForever, dir.path().to_path_buf(), |_| {});
        let mut input = new_job("slow");
        input.timeout_ms = Some(100);
        let job = engine.enqueue(&input).unwrap();

        let done = run_until_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::TimedOut);
        assert!(TIMEOUT_RE.is_match(done.last_error.as_deref().unwrap()));
        assert!(done.lease_expires_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runner_with_timeout_text_resolves_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _chat) = test_engine(
            Script::Fail("container run timed out".to_string()),
            dir.path().to_path_buf(),
            |_| {},
        );
        let job = engine.enqueue(&new_job("x")).unwrap();
        let done = run_until_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_live_runner_without_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, chat) =
            test_engine(Script::SleepForever, dir.path().to_path_buf(), |_| {});
        let job = engine.enqueue(&new_job("x")).unwrap();

        engine.tick().await.unwrap();
        // Let the runner start and register its token.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(engine.inflight.contains_key(&job.id));

        assert_eq!(engine.cancel(&job.id).unwrap(), CancelOutcome::Canceled);
        let done = run_until_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Canceled);
        // The runner lost the transition race, so no completion message.
        assert!(chat.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_result_spills_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let long = "line of output\n".repeat(40); // 600 chars
        let (engine, chat) = test_engine(
            Script::Reply(long.clone()),
            dir.path().to_path_buf(),
            |cfg| cfg.inline_max_chars = 100,
        );
        let job = engine.enqueue(&new_job("x")).unwrap();

        let done = run_until_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.output_truncated);
        let rel = done.output_path.unwrap();
        assert_eq!(rel, format!("jobs/{}/output.md", job.id));
        let full = dir.path().join("main").join(&rel);
        assert_eq!(std::fs::read_to_string(full).unwrap(), long.trim());
        // Inline summary capped at min(1000, inline_max_chars).
        assert!(done.result_summary.unwrap().len() <= 100);

        let sent = chat.sent.lock().unwrap();
        assert!(sent[0].1.contains(&format!("Output saved to: {rel}")));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _chat) =
            test_engine(Script::SleepForever, dir.path().to_path_buf(), |cfg| {
                cfg.max_concurrent = 2;
            });
        for i in 0..4 {
            engine.enqueue(&new_job(&format!("j{i}"))).unwrap();
        }
        engine.tick().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(engine.inflight.len(), 2);
        // A second tick does not over-claim.
        engine.tick().await.unwrap();
        assert_eq!(engine.inflight.len(), 2);
    }

    #[test]
    fn completion_message_omits_empty_blocks() {
        let msg = completion_message("J1", JobStatus::Succeeded, 4_600, None, Some("done"));
        assert_eq!(msg, "Background job J1 succeeded.\n\nDuration: 5s.\n\nSummary:\ndone");

        let msg = completion_message("J2", JobStatus::TimedOut, 100, None, None);
        assert_eq!(msg, "Background job J2 timed_out.\n\nDuration: 0s.");

        let msg =
            completion_message("J3", JobStatus::Succeeded, 1_000, Some("jobs/J3/output.md"), None);
        assert!(msg.contains("Output saved to: jobs/J3/output.md"));
    }

    #[test]
    fn eta_tag_parsing() {
        assert_eq!(eta_from_tags(&["eta:2".to_string()]), Some(2.0));
        assert_eq!(eta_from_tags(&["eta:2.5".to_string()]), Some(2.5));
        assert_eq!(eta_from_tags(&["eta:soon".to_string()]), None);
        assert_eq!(eta_from_tags(&["deploy".to_string()]), None);
    }
}
