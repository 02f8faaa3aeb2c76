//! Periodic retention enforcement.
//!
//! One loop, many small cleanup steps. Every step is isolated — a failing
//! step logs and the pass continues, so a wedged directory can never stall
//! retention for the databases (or vice versa).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use dotclaw_core::config::MaintenanceConfig;
use dotclaw_core::paths::InstallPaths;
use dotclaw_jobs::JobStore;
use dotclaw_memory::MemoryStore;
use dotclaw_scheduler::SchedulerEngine;
use dotclaw_store::{snapshot, ChatStore};

/// Orphaned IPC files are fair game after this long.
const IPC_ORPHAN_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// Error sentinels stick around longer for postmortems.
const IPC_ERROR_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
/// Stale container-id temp files.
const CID_MAX_AGE: Duration = Duration::from_secs(3600);
/// Session snapshots used by isolated background jobs.
const SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
/// Tool-audit retention.
const TOOL_AUDIT_RETENTION_MS: i64 = 30 * 24 * 3_600_000;

pub struct MaintenanceLoop {
    cfg: MaintenanceConfig,
    memory_cfg: dotclaw_core::config::MemoryMaintenanceConfig,
    paths: InstallPaths,
    chat_store: Arc<ChatStore>,
    memory: Arc<MemoryStore>,
    jobs: Arc<JobStore>,
    scheduler: Arc<SchedulerEngine>,
}

impl MaintenanceLoop {
    pub fn new(
        cfg: MaintenanceConfig,
        memory_cfg: dotclaw_core::config::MemoryMaintenanceConfig,
        paths: InstallPaths,
        chat_store: Arc<ChatStore>,
        memory: Arc<MemoryStore>,
        jobs: Arc<JobStore>,
        scheduler: Arc<SchedulerEngine>,
    ) -> Self {
        Self {
            cfg,
            memory_cfg,
            paths,
            chat_store,
            memory,
            jobs,
            scheduler,
        }
    }

    /// Run until `shutdown` broadcasts true, one pass per interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.cfg.interval_ms, "maintenance loop started");
        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would run maintenance at boot; skip it.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_pass(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("maintenance loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full maintenance pass. Public so operators (and tests) can force
    /// a pass outside the schedule.
    pub fn run_pass(&self) {
        let now = Utc::now().timestamp_millis();

        step("memory maintenance", || {
            let report = self.memory.maintain(&self.memory_cfg, now)?;
            if report.expired + report.pruned > 0 {
                info!(
                    expired = report.expired,
                    pruned = report.pruned,
                    "memory retention applied"
                );
            }
            Ok(())
        });

        step("trace retention", || {
            let max_age = Duration::from_secs(self.cfg.retention_days.max(0) as u64 * 86_400);
            let removed = purge_files_older_than(&self.paths.traces_dir, max_age, |_| true)?;
            if removed > 0 {
                info!(removed, "old trace files removed");
            }
            Ok(())
        });

        step("orphaned ipc files", || {
            let removed = purge_files_older_than(&self.paths.ipc_dir, IPC_ORPHAN_MAX_AGE, |p| {
                p.file_name().and_then(|n| n.to_str()) != Some("error")
            })? + purge_files_older_than(&self.paths.ipc_dir, IPC_ERROR_MAX_AGE, |p| {
                p.file_name().and_then(|n| n.to_str()) == Some("error")
            })?;
            if removed > 0 {
                info!(removed, "orphaned ipc files removed");
            }
            Ok(())
        });

        step("finished jobs", || {
            let removed = self.jobs.purge_finished_before(now - self.cfg.job_retention_ms)?;
            if removed > 0 {
                info!(removed, "finished jobs purged");
            }
            Ok(())
        });

        step("task run logs", || {
            let removed = self
                .scheduler
                .purge_run_logs_before(now - self.cfg.task_log_retention_ms)?;
            if removed > 0 {
                info!(removed, "task run logs purged");
            }
            Ok(())
        });

        step("tool audit", || {
            let removed = self
                .chat_store
                .purge_tool_audit_before(now - TOOL_AUDIT_RETENTION_MS)?;
            if removed > 0 {
                info!(removed, "tool audit rows purged");
            }
            Ok(())
        });

        step("stale cid files", || {
            let removed = purge_files_older_than(&self.paths.data_dir, CID_MAX_AGE, |p| {
                p.extension().and_then(|e| e.to_str()) == Some("cid")
            })?;
            if removed > 0 {
                info!(removed, "stale cid files removed");
            }
            Ok(())
        });

        step("session snapshots", || {
            let removed =
                snapshot::purge_snapshots_older_than(&self.paths.sessions_dir, SNAPSHOT_MAX_AGE)?;
            if removed > 0 {
                info!(removed, "session snapshots purged");
            }
            Ok(())
        });
    }
}

/// Run one cleanup step; failures are logged and swallowed.
fn step(name: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    if let Err(e) = f() {
        error!(step = name, "maintenance step failed: {e}");
    }
}

/// Delete regular files under `dir` (recursively) older than `max_age` and
/// matching `filter`. A missing directory is zero work, not an error.
fn purge_files_older_than(
    dir: &Path,
    max_age: Duration,
    filter: impl Fn(&Path) -> bool + Copy,
) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let now = std::time::SystemTime::now();
    let mut removed = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            removed += purge_files_older_than(&path, max_age, filter)?;
            continue;
        }
        if !filter(&path) {
            continue;
        }
        let age = now.duration_since(meta.modified()?).unwrap_or_default();
        if age > max_age {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "could not remove: {e}"),
            }
        }
    }
    Ok(removed)
}
