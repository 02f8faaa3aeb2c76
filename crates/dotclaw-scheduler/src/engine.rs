use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use dotclaw_core::config::SchedulerConfig;
use dotclaw_core::timeparse::validate_timezone;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_run;
use crate::types::*;

/// Executes one due task on the scheduled lane.
///
/// The host implements this by building an agent context and dispatching to
/// the container; tests use canned runners. `Ok` carries the result text,
/// `Err` the failure message recorded as `last_error`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &ScheduledTask) -> std::result::Result<String, String>;
}

/// Core scheduler: persists tasks to SQLite and drives execution.
pub struct SchedulerEngine {
    conn: Arc<Mutex<Connection>>,
    runner: Arc<dyn TaskRunner>,
    cfg: SchedulerConfig,
    default_tz: Tz,
}

impl SchedulerEngine {
    /// Create a new engine, initialising the schema if needed.
    pub fn new(conn: Connection, runner: Arc<dyn TaskRunner>, cfg: SchedulerConfig) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            runner,
            cfg,
            default_tz: chrono_tz::UTC,
        })
    }

    /// Add a new task. The first fire time is computed immediately; a
    /// schedule with no future fire is rejected.
    pub fn add_task(&self, input: NewTask, now: i64) -> Result<ScheduledTask> {
        let tz = validate_timezone(&input.timezone, self.default_tz);
        let next = compute_next_run(&input.schedule, tz, ms_to_dt(now), None)?
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule("schedule has no future fire".to_string())
            })?;

        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks
             (id, group_id, chat_id, prompt, schedule_kind, schedule_value,
              context_mode, timezone, next_run, retry_count, status,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,0,'active',?10,?10)",
            rusqlite::params![
                id,
                input.group,
                input.chat_id,
                input.prompt,
                input.schedule.kind(),
                input.schedule.value_string(),
                input.context_mode.to_string(),
                tz.name(),
                next.timestamp_millis(),
                now,
            ],
        )?;
        info!(task_id = %id, kind = input.schedule.kind(), "task added");
        drop(conn);
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<ScheduledTask> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
            rusqlite::params![id],
            row_to_task,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SchedulerError::TaskNotFound {
                id: id.to_string(),
            },
            other => SchedulerError::Database(other),
        })
    }

    /// All tasks of a group, soonest fire first.
    pub fn list(&self, group: &str) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE group_id = ?1
             ORDER BY next_run IS NULL, next_run",
        ))?;
        let rows = stmt.query_map(rusqlite::params![group], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn pause(&self, id: &str, now: i64) -> Result<()> {
        self.flip_status(id, TaskStatus::Paused, now)
    }

    pub fn resume(&self, id: &str, now: i64) -> Result<()> {
        self.flip_status(id, TaskStatus::Active, now)
    }

    fn flip_status(&self, id: &str, status: TaskStatus, now: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE scheduled_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.to_string(), now, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Delete a task and its run logs (children first, FK).
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_run_logs WHERE task_id = ?1",
            rusqlite::params![id],
        )?;
        let n = tx.execute(
            "DELETE FROM scheduled_tasks WHERE id = ?1",
            rusqlite::params![id],
        )?;
        tx.commit()?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "task removed");
        Ok(())
    }

    /// Run history for a task, newest first.
    pub fn run_logs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, run_at, ok, result, error
             FROM task_run_logs WHERE task_id = ?1
             ORDER BY run_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![task_id, limit as i64], |row| {
            Ok(TaskRunLog {
                id: row.get(0)?,
                task_id: row.get(1)?,
                run_at: row.get(2)?,
                ok: row.get::<_, i64>(3)? != 0,
                result: row.get(4)?,
                error: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete run logs older than `cutoff` (maintenance).
    pub fn purge_run_logs_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM task_run_logs WHERE run_at < ?1",
            rusqlite::params![cutoff],
        )?)
    }

    /// Main event loop. Polls for due tasks until `shutdown` broadcasts true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(poll_ms = self.cfg.poll_interval_ms, "scheduler engine started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.cfg.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now().timestamp_millis();
                    if let Err(e) = self.tick(now).await {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Execute every task due at `now`. Returns how many ran.
    pub async fn tick(&self, now: i64) -> Result<usize> {
        let due: Vec<ScheduledTask> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run",
            ))?;
            let rows = stmt.query_map(rusqlite::params![now], row_to_task)?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let count = due.len();
        for task in due {
            // The runner acquires the scheduled lane itself; one-at-a-time
            // here keeps run logs ordered per tick.
            match self.runner.run_task(&task).await {
                Ok(result) => self.record_success(&task, &result, now)?,
                Err(err) => self.record_failure(&task, &err, now)?,
            }
        }
        Ok(count)
    }

    fn record_success(&self, task: &ScheduledTask, result: &str, now: i64) -> Result<()> {
        let tz = validate_timezone(&task.timezone, self.default_tz);
        let next = compute_next_run(&task.schedule, tz, ms_to_dt(now), Some(ms_to_dt(now)))
            .unwrap_or_else(|e| {
                warn!(task_id = %task.id, "next-run computation failed: {e}");
                None
            });
        // No future fire means the schedule is exhausted — the task
        // completes (a `once` task lands here right after its single run).
        let status = if next.is_some() {
            TaskStatus::Active
        } else {
            TaskStatus::Completed
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE scheduled_tasks SET
               last_run = ?1, last_result = ?2, last_error = NULL,
               retry_count = 0, next_run = ?3, status = ?4, updated_at = ?1
             WHERE id = ?5",
            rusqlite::params![
                now,
                truncate(result, 4000),
                next.map(|dt| dt.timestamp_millis()),
                status.to_string(),
                task.id,
            ],
        )?;
        tx.execute(
            "INSERT INTO task_run_logs (task_id, run_at, ok, result) VALUES (?1, ?2, 1, ?3)",
            rusqlite::params![task.id, now, truncate(result, 4000)],
        )?;
        tx.commit()?;
        info!(task_id = %task.id, next_status = %status, "task run succeeded");
        Ok(())
    }

    fn record_failure(&self, task: &ScheduledTask, err: &str, now: i64) -> Result<()> {
        let retries = task.retry_count;
        let exhausted = retries >= self.cfg.task_max_retries;
        // Exponential backoff capped at the configured ceiling.
        let backoff = (self.cfg.task_retry_base_ms.saturating_mul(1 << retries.min(20)))
            .min(self.cfg.task_retry_max_ms);

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if exhausted {
            tx.execute(
                "UPDATE scheduled_tasks SET
                   last_error = ?1, next_run = NULL, status = 'completed',
                   retry_count = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![err, retries + 1, now, task.id],
            )?;
            warn!(task_id = %task.id, retries, "task retries exhausted");
        } else {
            tx.execute(
                "UPDATE scheduled_tasks SET
                   last_error = ?1, next_run = ?2, retry_count = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![err, now + backoff, retries + 1, now, task.id],
            )?;
        }
        tx.execute(
            "INSERT INTO task_run_logs (task_id, run_at, ok, error) VALUES (?1, ?2, 0, ?3)",
            rusqlite::params![task.id, now, err],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

const TASK_COLUMNS: &str = "id, group_id, chat_id, prompt, schedule_kind, schedule_value, \
     context_mode, timezone, next_run, last_run, last_result, state, retry_count, \
     last_error, status, created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let kind: String = row.get(4)?;
    let value: String = row.get(5)?;
    let context: String = row.get(6)?;
    let status: String = row.get(14)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        group: row.get(1)?,
        chat_id: row.get(2)?,
        prompt: row.get(3)?,
        schedule: ScheduleSpec::from_columns(&kind, &value)
            .unwrap_or_else(|| ScheduleSpec::Once(value)),
        context_mode: context.parse().unwrap_or(ContextMode::Group),
        timezone: row.get(7)?,
        next_run: row.get(8)?,
        last_run: row.get(9)?,
        last_result: row.get(10)?,
        state: row.get(11)?,
        retry_count: row.get::<_, i64>(12)? as u32,
        last_error: row.get(13)?,
        status: status.parse().unwrap_or(TaskStatus::Active),
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}
