//! Fan-out / fan-in orchestration over the background-job engine.
//!
//! Each sub-task becomes a regular background job tagged with the workflow
//! run id. The orchestrator enqueues lazily up to its own concurrency bound,
//! polls the rows to completion under a deadline, cancels stragglers, and
//! optionally runs one aggregation pass over the collected results.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::JobEngine;
use crate::error::Result;
use crate::types::{BackgroundJob, NewJob};

/// Poll cadence while waiting on sub-jobs.
const ORCH_POLL_MS: u64 = 2_000;
/// Overall deadline when the request does not set one.
const ORCH_DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// One sub-task of a fan-out.
#[derive(Debug, Clone)]
pub struct SubTask {
    pub name: String,
    pub prompt: String,
    pub model_override: Option<String>,
    pub timeout_ms: Option<i64>,
    pub tool_allow: Option<Vec<String>>,
    pub tool_deny: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationRequest {
    pub group: String,
    pub chat_id: String,
    /// Display name recorded on the workflow run.
    pub name: String,
    pub tasks: Vec<SubTask>,
    /// Defaults to the number of tasks (unbounded fan-out).
    pub max_concurrent: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub aggregation_prompt: Option<String>,
}

/// Outcome of one sub-task, in spawn order.
#[derive(Debug, Clone)]
pub struct SubTaskResult {
    pub name: String,
    pub status: String,
    pub result_summary: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestrationOutput {
    pub ok: bool,
    pub run_id: String,
    pub results: Vec<SubTaskResult>,
    pub aggregated_result: Option<String>,
}

/// Run a fan-out to completion. Mixed sub-task outcomes still return
/// `ok = true` — per-task status lives in `results`.
pub async fn orchestrate(
    engine: &Arc<JobEngine>,
    req: OrchestrationRequest,
) -> Result<OrchestrationOutput> {
    let now = Utc::now().timestamp_millis();
    let store = engine.store();
    let run_id = store.create_workflow_run(&req.group, &req.name, now)?;
    let task_count = req.tasks.len();
    let max_concurrent = req.max_concurrent.unwrap_or(task_count).max(1);
    let deadline = tokio::time::Instant::now()
        + std::time::Duration::from_millis(req.timeout_ms.unwrap_or(ORCH_DEFAULT_TIMEOUT_MS));

    info!(run_id = %run_id, tasks = task_count, max_concurrent, "orchestration started");

    let mut pending: VecDeque<usize> = (0..task_count).collect();
    let mut active: Vec<(usize, String)> = Vec::new();
    let mut spawn_errors: HashMap<usize, String> = HashMap::new();
    let mut job_ids: HashMap<usize, String> = HashMap::new();
    let mut finals: HashMap<usize, BackgroundJob> = HashMap::new();

    while !pending.is_empty() || !active.is_empty() {
        while active.len() < max_concurrent {
            let Some(i) = pending.pop_front() else { break };
            let task = &req.tasks[i];
            let input = NewJob {
                group: req.group.clone(),
                chat_id: req.chat_id.clone(),
                prompt: task.prompt.clone(),
                context_mode: Some("isolated".to_string()),
                timeout_ms: task.timeout_ms,
                max_tool_steps: None,
                tool_policy: tool_policy_json(task),
                model_override: task.model_override.clone(),
                priority: 0,
                tags: vec![format!("workflow:{run_id}")],
                parent_trace_id: Some(run_id.clone()),
            };
            match engine.enqueue(&input) {
                Ok(job) => {
                    job_ids.insert(i, job.id.clone());
                    active.push((i, job.id));
                }
                Err(e) => {
                    warn!(run_id = %run_id, task = %task.name, "sub-job spawn failed: {e}");
                    spawn_errors.insert(i, e.to_string());
                }
            }
        }
        if active.is_empty() && pending.is_empty() {
            break;
        }

        tokio::time::sleep(std::time::Duration::from_millis(ORCH_POLL_MS)).await;

        let mut still_active = Vec::with_capacity(active.len());
        for (i, id) in active {
            match store.get(&id) {
                Ok(row) if row.status.is_terminal() => {
                    finals.insert(i, row);
                }
                Ok(_) => still_active.push((i, id)),
                Err(e) => {
                    warn!(job_id = %id, "sub-job refresh failed: {e}");
                    still_active.push((i, id));
                }
            }
        }
        active = still_active;

        if tokio::time::Instant::now() >= deadline && !active.is_empty() {
            warn!(run_id = %run_id, stragglers = active.len(), "orchestration deadline, canceling");
            for (_, id) in &active {
                if let Err(e) = engine.cancel(id) {
                    warn!(job_id = %id, "straggler cancel failed: {e}");
                }
            }
            break;
        }
    }

    // Collect in spawn order, including spawn failures and canceled
    // stragglers (re-read for their post-cancel row).
    let mut results = Vec::with_capacity(task_count);
    for (i, task) in req.tasks.iter().enumerate() {
        let result = if let Some(err) = spawn_errors.get(&i) {
            SubTaskResult {
                name: task.name.clone(),
                status: "failed".to_string(),
                result_summary: None,
                last_error: Some(err.clone()),
            }
        } else {
            let row = match finals.remove(&i) {
                Some(row) => Some(row),
                None => job_ids.get(&i).and_then(|id| store.get(id).ok()),
            };
            match row {
                Some(row) => SubTaskResult {
                    name: task.name.clone(),
                    status: row.status.to_string(),
                    result_summary: row.result_summary,
                    last_error: row.last_error,
                },
                None => SubTaskResult {
                    name: task.name.clone(),
                    status: "failed".to_string(),
                    result_summary: None,
                    last_error: Some("sub-job row missing".to_string()),
                },
            }
        };
        store.record_workflow_step(
            &run_id,
            &result.name,
            job_ids.get(&i).map(String::as_str),
            &result.status,
            result.result_summary.as_deref(),
            result.last_error.as_deref(),
        )?;
        results.push(result);
    }

    let aggregated_result = match req.aggregation_prompt {
        Some(ref prompt) if results.iter().any(|r| r.result_summary.is_some()) => {
            let composed = compose_aggregation_prompt(prompt, &results);
            match engine.executor().run_oneshot(&req.group, &composed).await {
                Ok(text) => Some(text),
                // Aggregation is best-effort; per-task results still return.
                Err(e) => {
                    warn!(run_id = %run_id, "aggregation pass failed: {e}");
                    None
                }
            }
        }
        _ => None,
    };

    store.finish_workflow_run(
        &run_id,
        "succeeded",
        aggregated_result.as_deref(),
        Utc::now().timestamp_millis(),
    )?;

    Ok(OrchestrationOutput {
        ok: !results.is_empty(),
        run_id,
        results,
        aggregated_result,
    })
}

fn tool_policy_json(task: &SubTask) -> Option<serde_json::Value> {
    if task.tool_allow.is_none() && task.tool_deny.is_empty() {
        return None;
    }
    Some(serde_json::json!({
        "allow": task.tool_allow,
        "deny": task.tool_deny,
    }))
}

fn compose_aggregation_prompt(prompt: &str, results: &[SubTaskResult]) -> String {
    let mut out = String::from(prompt);
    out.push_str("\n\n# Task results\n");
    for r in results {
        out.push_str(&format!("\n## {} ({})\n", r.name, r.status));
        match (&r.result_summary, &r.last_error) {
            (Some(summary), _) => out.push_str(summary),
            (None, Some(err)) => out.push_str(&format!("error: {err}")),
            (None, None) => out.push_str("(no output)"),
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::JobExecutor;
    use crate::store::JobStore;
    use crate::types::JobStatus;
    use async_trait::async_trait;
    use dotclaw_core::config::{BackgroundJobsConfig, ProgressConfig};
    use dotclaw_core::port::{ChatPort, MessageRef, PortError};
    use rusqlite::Connection;
    use tokio_util::sync::CancellationToken;

    struct NullChat;

    #[async_trait]
    impl ChatPort for NullChat {
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

    /// Behaviour keyed on the sub-task prompt text.
    struct PromptScriptedExecutor;

    #[async_trait]
    impl JobExecutor for PromptScriptedExecutor {
        async fn execute(
            &self,
            job: &crate::types::BackgroundJob,
            cancel: CancellationToken,
        ) -> std::result::Result<Option<String>, String> {
            match job.prompt.as_str() {
                "fail" => Err("deliberate failure".to_string()),
                "hang" => {
                    cancel.cancelled().await;
                    Err("canceled".to_string())
                }
                other => Ok(Some(format!("done: {other}"))),
            }
        }

        async fn run_oneshot(
            &self,
            _group: &str,
            prompt: &str,
        ) -> std::result::Result<String, String> {
            Ok(format!("synthesis over {} bytes", prompt.len()))
        }
    }

    fn engine() -> Arc<JobEngine> {
        let store = Arc::new(JobStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let cfg = BackgroundJobsConfig {
            poll_interval_ms: 50,
            max_concurrent: 8,
            ..BackgroundJobsConfig::default()
        };
        JobEngine::new(
            store,
            Arc::new(PromptScriptedExecutor),
            Arc::new(NullChat),
            std::env::temp_dir(),
            cfg,
            ProgressConfig {
                enabled: false,
                ..ProgressConfig::default()
            },
        )
    }

    fn spawn_tick_loop(engine: Arc<JobEngine>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let _ = engine.tick().await;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
    }

    fn task(name: &str, prompt: &str) -> SubTask {
        SubTask {
            name: name.to_string(),
            prompt: prompt.to_string(),
            model_override: None,
            timeout_ms: None,
            tool_allow: None,
            tool_deny: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_preserves_order_and_aggregates() {
        let engine = engine();
        let ticker = spawn_tick_loop(engine.clone());

        let mut hang = task("t-hang", "hang");
        hang.timeout_ms = Some(100); // forces a per-job timeout
        let req = OrchestrationRequest {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            name: "mixed".to_string(),
            tasks: vec![
                task("t-ok-1", "alpha"),
                task("t-fail", "fail"),
                hang,
                task("t-ok-2", "beta"),
            ],
            max_concurrent: Some(2),
            timeout_ms: Some(60_000),
            aggregation_prompt: Some("Summarize everything".to_string()),
        };

        let out = orchestrate(&engine, req).await.unwrap();
        ticker.abort();

        assert!(out.ok);
        assert_eq!(out.results.len(), 4);
        let names: Vec<_> = out.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["t-ok-1", "t-fail", "t-hang", "t-ok-2"]);

        assert_eq!(out.results[0].status, "succeeded");
        assert_eq!(out.results[1].status, "failed");
        assert_eq!(out.results[2].status, "timed_out");
        assert_eq!(out.results[3].status, "succeeded");
        assert_eq!(
            out.results[3].result_summary.as_deref(),
            Some("done: beta")
        );
        assert!(out.aggregated_result.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_stragglers() {
        let engine = engine();
        let ticker = spawn_tick_loop(engine.clone());

        let req = OrchestrationRequest {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            name: "stuck".to_string(),
            tasks: vec![task("t-stuck", "hang")],
            max_concurrent: None,
            timeout_ms: Some(5_000),
            aggregation_prompt: None,
        };

        let out = orchestrate(&engine, req).await.unwrap();
        ticker.abort();

        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].status, "canceled");
        assert!(out.aggregated_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn aggregation_skipped_when_nothing_succeeded() {
        let engine = engine();
        let ticker = spawn_tick_loop(engine.clone());

        let req = OrchestrationRequest {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            name: "all-fail".to_string(),
            tasks: vec![task("t1", "fail")],
            max_concurrent: None,
            timeout_ms: Some(60_000),
            aggregation_prompt: Some("Summarize".to_string()),
        };

        let out = orchestrate(&engine, req).await.unwrap();
        ticker.abort();
        assert_eq!(out.results[0].status, "failed");
        assert!(out.aggregated_result.is_none());
    }
}
