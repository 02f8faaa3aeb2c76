use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{JobError, Result};
use crate::types::*;

/// Persistent job queue. The engine is the sole mutator of
/// `status`/`lease_expires_at`; everything here keeps the §invariants of the
/// status machine: terminal rows never change, leases exist only while
/// running.
pub struct JobStore {
    db: Mutex<Connection>,
}

/// What `cancel` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The row was queued or running and is now canceled.
    Canceled,
    /// The row was already terminal; nothing changed.
    AlreadyTerminal,
}

impl JobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Persist a `queued` row and its `queued` event. A model override not
    /// on the (non-empty) allowlist is rejected before anything is written.
    #[instrument(skip(self, input, allowlist), fields(group = %input.group))]
    pub fn enqueue(
        &self,
        input: &NewJob,
        default_context_mode: &str,
        allowlist: &[String],
        now: i64,
    ) -> Result<BackgroundJob> {
        if let Some(ref model) = input.model_override {
            if !allowlist.is_empty() && !allowlist.iter().any(|m| m == model) {
                return Err(JobError::ModelNotPermitted {
                    model: model.clone(),
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        let context_mode = input
            .context_mode
            .clone()
            .unwrap_or_else(|| default_context_mode.to_string());

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO background_jobs
             (id, group_id, chat_id, prompt, context_mode, status, timeout_ms,
              max_tool_steps, tool_policy_json, model_override, priority, tags,
              parent_trace_id, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,'queued',?6,?7,?8,?9,?10,?11,?12,?13,?13)",
            rusqlite::params![
                id,
                input.group,
                input.chat_id,
                input.prompt,
                context_mode,
                input.timeout_ms,
                input.max_tool_steps,
                input
                    .tool_policy
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                input.model_override,
                input.priority,
                serde_json::to_string(&input.tags)?,
                input.parent_trace_id,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO background_job_events (job_id, level, message, created_at)
             VALUES (?1, 'info', 'queued', ?2)",
            rusqlite::params![id, now],
        )?;
        tx.commit()?;
        info!(job_id = %id, "job queued");
        drop(db);
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<BackgroundJob> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = ?1"),
            rusqlite::params![id],
            row_to_job,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => JobError::JobNotFound { id: id.to_string() },
            other => JobError::Database(other),
        })
    }

    /// Jobs of a group, newest first.
    pub fn list(&self, group: &str, limit: usize) -> Result<Vec<BackgroundJob>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM background_jobs
             WHERE group_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        ))?;
        let rows = stmt.query_map(rusqlite::params![group, limit as i64], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Atomically claim the best queued row: flip it to `running` with a
    /// fresh lease in one statement so two pollers can never claim the same
    /// job. Ordering is `priority DESC, created_at ASC`.
    pub fn claim_next(&self, now: i64, lease_ms: i64) -> Result<Option<BackgroundJob>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let claimed = tx
            .query_row(
                &format!(
                    "UPDATE background_jobs
                     SET status = 'running', started_at = ?1, updated_at = ?1,
                         lease_expires_at = ?1 + ?2
                     WHERE id = (SELECT id FROM background_jobs
                                 WHERE status = 'queued'
                                 ORDER BY priority DESC, created_at ASC
                                 LIMIT 1)
                     RETURNING {JOB_COLUMNS}",
                ),
                rusqlite::params![now, lease_ms],
                row_to_job,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(ref job) = claimed {
            tx.execute(
                "INSERT INTO background_job_events (job_id, level, message, created_at)
                 VALUES (?1, 'info', 'started', ?2)",
                rusqlite::params![job.id, now],
            )?;
        }
        tx.commit()?;
        if let Some(ref job) = claimed {
            debug!(job_id = %job.id, priority = job.priority, "job claimed");
        }
        Ok(claimed)
    }

    /// Push a running job's lease out to `expires_at`. No-op (false) for
    /// rows that are not running.
    pub fn extend_lease(&self, id: &str, expires_at: i64) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE background_jobs SET lease_expires_at = ?1
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![expires_at, id],
        )?;
        Ok(n > 0)
    }

    /// Sweep `running` rows whose lease expired to `timed_out`. Returns the
    /// ids reclaimed.
    pub fn expire_leases(&self, now: i64) -> Result<Vec<String>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let expired: Vec<String> = {
            let mut stmt = tx.prepare(
                "UPDATE background_jobs
                 SET status = 'timed_out', finished_at = ?1, updated_at = ?1,
                     lease_expires_at = NULL,
                     last_error = 'lease expired: runner timed out'
                 WHERE status = 'running' AND lease_expires_at < ?1
                 RETURNING id",
            )?;
            let rows = stmt.query_map(rusqlite::params![now], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        };
        for id in &expired {
            tx.execute(
                "INSERT INTO background_job_events (job_id, level, message, created_at)
                 VALUES (?1, 'error', 'lease expired', ?2)",
                rusqlite::params![id, now],
            )?;
        }
        tx.commit()?;
        Ok(expired)
    }

    /// Resolve a finished run. Only a `running` row transitions; a row that
    /// went terminal in the meantime (cancel, lease sweep) is left alone.
    /// Returns whether this call performed the transition.
    #[allow(clippy::too_many_arguments)]
    pub fn finish(
        &self,
        id: &str,
        status: JobStatus,
        result_summary: Option<&str>,
        output_path: Option<&str>,
        output_truncated: bool,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let n = tx.execute(
            "UPDATE background_jobs
             SET status = ?1, result_summary = ?2, output_path = ?3,
                 output_truncated = ?4, last_error = ?5,
                 finished_at = ?6, updated_at = ?6, lease_expires_at = NULL
             WHERE id = ?7 AND status = 'running'",
            rusqlite::params![
                status.to_string(),
                result_summary,
                output_path,
                output_truncated as i64,
                last_error,
                now,
                id,
            ],
        )?;
        if n > 0 {
            let (level, message) = match status {
                JobStatus::Succeeded => (EventLevel::Info, "completed".to_string()),
                JobStatus::Canceled => (EventLevel::Warn, "canceled".to_string()),
                JobStatus::TimedOut => (EventLevel::Error, "timed out".to_string()),
                _ => (
                    EventLevel::Error,
                    format!("failed: {}", last_error.unwrap_or("unknown error")),
                ),
            };
            tx.execute(
                "INSERT INTO background_job_events (job_id, level, message, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, level.to_string(), message, now],
            )?;
        }
        tx.commit()?;
        Ok(n > 0)
    }

    /// Cancel a job. Terminal rows are a no-op; queued or running rows flip
    /// to `canceled` with `finished_at = now`.
    pub fn cancel(&self, id: &str, now: i64) -> Result<CancelOutcome> {
        let current = self.get(id)?;
        if current.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let n = tx.execute(
            "UPDATE background_jobs
             SET status = 'canceled', finished_at = ?1, updated_at = ?1,
                 lease_expires_at = NULL
             WHERE id = ?2 AND status IN ('queued', 'running')",
            rusqlite::params![now, id],
        )?;
        if n > 0 {
            tx.execute(
                "INSERT INTO background_job_events (job_id, level, message, created_at)
                 VALUES (?1, 'warn', 'canceled', ?2)",
                rusqlite::params![id, now],
            )?;
        }
        tx.commit()?;
        if n > 0 {
            info!(job_id = %id, "job canceled");
            Ok(CancelOutcome::Canceled)
        } else {
            // Lost the race with a concurrent terminal transition.
            Ok(CancelOutcome::AlreadyTerminal)
        }
    }

    /// Append a progress/log event and touch `updated_at`. Safe to call
    /// repeatedly — the job row itself does not change state.
    pub fn record_update(
        &self,
        id: &str,
        level: EventLevel,
        message: &str,
        now: i64,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let n = tx.execute(
            "UPDATE background_jobs SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        if n == 0 {
            return Err(JobError::JobNotFound { id: id.to_string() });
        }
        tx.execute(
            "INSERT INTO background_job_events (job_id, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, level.to_string(), message, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Event log for one job, oldest first.
    pub fn events(&self, id: &str) -> Result<Vec<JobEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, job_id, level, message, created_at
             FROM background_job_events WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![id], |row| {
            let level: String = row.get(2)?;
            Ok(JobEvent {
                id: row.get(0)?,
                job_id: row.get(1)?,
                level: level.parse().unwrap_or(EventLevel::Info),
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Purge terminal jobs finished before `cutoff`, events first.
    pub fn purge_finished_before(&self, cutoff: i64) -> Result<usize> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM background_job_events WHERE job_id IN (
               SELECT id FROM background_jobs
               WHERE finished_at IS NOT NULL AND finished_at < ?1)",
            rusqlite::params![cutoff],
        )?;
        let n = tx.execute(
            "DELETE FROM background_jobs
             WHERE finished_at IS NOT NULL AND finished_at < ?1",
            rusqlite::params![cutoff],
        )?;
        tx.commit()?;
        Ok(n)
    }

    // --- workflow runs ------------------------------------------------------

    /// Create a workflow-run header row.
    pub fn create_workflow_run(&self, group: &str, name: &str, now: i64) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO workflow_runs (id, group_id, name, status, created_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            rusqlite::params![id, group, name, now],
        )?;
        Ok(id)
    }

    /// Append one step result; insertion order is the step order.
    pub fn record_workflow_step(
        &self,
        run_id: &str,
        name: &str,
        job_id: Option<&str>,
        status: &str,
        result_summary: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO workflow_step_results
             (run_id, name, job_id, status, result_summary, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![run_id, name, job_id, status, result_summary, last_error],
        )?;
        Ok(())
    }

    pub fn finish_workflow_run(
        &self,
        run_id: &str,
        status: &str,
        aggregated: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE workflow_runs
             SET status = ?1, aggregated = ?2, finished_at = ?3 WHERE id = ?4",
            rusqlite::params![status, aggregated, now, run_id],
        )?;
        Ok(())
    }
}

const JOB_COLUMNS: &str = "id, group_id, chat_id, prompt, context_mode, status, \
     timeout_ms, max_tool_steps, tool_policy_json, model_override, priority, tags, \
     parent_trace_id, created_at, updated_at, started_at, finished_at, \
     lease_expires_at, last_error, result_summary, output_path, output_truncated";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackgroundJob> {
    let status: String = row.get(5)?;
    let tags: String = row.get(11)?;
    Ok(BackgroundJob {
        id: row.get(0)?,
        group: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        context_mode: row.get(4)?,
        status: status.parse().unwrap_or(JobStatus::Queued),
        timeout_ms: row.get(6)?,
        max_tool_steps: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        tool_policy_json: row.get(8)?,
        model_override: row.get(9)?,
        priority: row.get(10)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        parent_trace_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        started_at: row.get(15)?,
        finished_at: row.get(16)?,
        lease_expires_at: row.get(17)?,
        last_error: row.get(18)?,
        result_summary: row.get(19)?,
        output_path: row.get(20)?,
        output_truncated: row.get::<_, i64>(21)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn job(prompt: &str, priority: i64) -> NewJob {
        NewJob {
            group: "main".to_string(),
            chat_id: "c1".to_string(),
            prompt: prompt.to_string(),
            priority,
            ..NewJob::default()
        }
    }

    #[test]
    fn enqueue_writes_queued_row_and_event() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert_eq!(j.context_mode, "group");
        assert!(j.lease_expires_at.is_none());
        let events = s.events(&j.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "queued");
    }

    #[test]
    fn model_override_checked_against_allowlist() {
        let s = store();
        let mut j = job("x", 0);
        j.model_override = Some("gpt-nope".to_string());
        let allow = vec!["claude-sonnet-4-6".to_string()];
        assert!(matches!(
            s.enqueue(&j, "group", &allow, 1000),
            Err(JobError::ModelNotPermitted { .. })
        ));

        j.model_override = Some("claude-sonnet-4-6".to_string());
        assert!(s.enqueue(&j, "group", &allow, 1000).is_ok());
        // Empty allowlist accepts anything.
        j.model_override = Some("gpt-nope".to_string());
        assert!(s.enqueue(&j, "group", &[], 1000).is_ok());
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let s = store();
        let low_old = s.enqueue(&job("a", 0), "group", &[], 1000).unwrap();
        let high = s.enqueue(&job("b", 5), "group", &[], 2000).unwrap();
        let low_new = s.enqueue(&job("c", 0), "group", &[], 3000).unwrap();

        let c1 = s.claim_next(4000, 60_000).unwrap().unwrap();
        assert_eq!(c1.id, high.id);
        assert_eq!(c1.status, JobStatus::Running);
        assert_eq!(c1.lease_expires_at, Some(64_000));

        let c2 = s.claim_next(4000, 60_000).unwrap().unwrap();
        assert_eq!(c2.id, low_old.id);
        let c3 = s.claim_next(4000, 60_000).unwrap().unwrap();
        assert_eq!(c3.id, low_new.id);
        assert!(s.claim_next(4000, 60_000).unwrap().is_none());
    }

    #[test]
    fn expired_leases_are_reclaimed_as_timed_out() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        s.claim_next(1000, 500).unwrap().unwrap();

        assert!(s.expire_leases(1400).unwrap().is_empty());
        let expired = s.expire_leases(1600).unwrap();
        assert_eq!(expired, vec![j.id.clone()]);

        let row = s.get(&j.id).unwrap();
        assert_eq!(row.status, JobStatus::TimedOut);
        assert!(row.lease_expires_at.is_none());
        assert_eq!(row.finished_at, Some(1600));
    }

    #[test]
    fn finish_only_transitions_running_rows() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        // Not running yet — no transition.
        assert!(!s
            .finish(&j.id, JobStatus::Succeeded, Some("r"), None, false, None, 2000)
            .unwrap());

        s.claim_next(2000, 60_000).unwrap();
        assert!(s
            .finish(&j.id, JobStatus::Succeeded, Some("r"), None, false, None, 3000)
            .unwrap());
        // Terminal rows are absorbing.
        assert!(!s
            .finish(&j.id, JobStatus::Failed, None, None, false, Some("e"), 4000)
            .unwrap());

        let row = s.get(&j.id).unwrap();
        assert_eq!(row.status, JobStatus::Succeeded);
        assert_eq!(row.result_summary.as_deref(), Some("r"));
        let messages: Vec<_> = s
            .events(&j.id)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, ["queued", "started", "completed"]);
    }

    #[test]
    fn cancel_is_noop_on_terminal_rows() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        assert_eq!(s.cancel(&j.id, 2000).unwrap(), CancelOutcome::Canceled);
        let row = s.get(&j.id).unwrap();
        assert_eq!(row.status, JobStatus::Canceled);
        assert_eq!(row.finished_at, Some(2000));

        assert_eq!(s.cancel(&j.id, 3000).unwrap(), CancelOutcome::AlreadyTerminal);
        // finished_at untouched by the no-op.
        assert_eq!(s.get(&j.id).unwrap().finished_at, Some(2000));
    }

    #[test]
    fn record_update_touches_updated_at() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        s.record_update(&j.id, EventLevel::Progress, "halfway", 5000)
            .unwrap();
        assert_eq!(s.get(&j.id).unwrap().updated_at, 5000);
        assert!(s
            .events(&j.id)
            .unwrap()
            .iter()
            .any(|e| e.level == EventLevel::Progress && e.message == "halfway"));
    }

    #[test]
    fn purge_removes_old_terminal_jobs_with_events() {
        let s = store();
        let j = s.enqueue(&job("x", 0), "group", &[], 1000).unwrap();
        s.claim_next(1000, 60_000).unwrap();
        s.finish(&j.id, JobStatus::Succeeded, None, None, false, None, 2000)
            .unwrap();
        let live = s.enqueue(&job("y", 0), "group", &[], 1000).unwrap();

        assert_eq!(s.purge_finished_before(5000).unwrap(), 1);
        assert!(matches!(s.get(&j.id), Err(JobError::JobNotFound { .. })));
        assert!(s.get(&live.id).is_ok());
    }

    #[test]
    fn workflow_steps_keep_insertion_order() {
        let s = store();
        let run = s.create_workflow_run("main", "fanout", 1000).unwrap();
        s.record_workflow_step(&run, "b-step", None, "succeeded", Some("ok"), None)
            .unwrap();
        s.record_workflow_step(&run, "a-step", None, "failed", None, Some("err"))
            .unwrap();
        s.finish_workflow_run(&run, "succeeded", Some("agg"), 2000)
            .unwrap();

        let db = s.db.lock().unwrap();
        let names: Vec<String> = db
            .prepare("SELECT name FROM workflow_step_results WHERE run_id = ?1 ORDER BY id")
            .unwrap()
            .query_map([&run], |r| r.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(names, ["b-step", "a-step"]);
    }
}
