use serde::{Deserialize, Serialize};

/// Lifecycle state of a background job.
///
/// `queued → running → {succeeded | failed | timed_out | canceled}`;
/// `canceled` may also follow `queued`. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            "timed_out" => Ok(JobStatus::TimedOut),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Severity of a job event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Progress,
    Warn,
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventLevel::Info => "info",
            EventLevel::Progress => "progress",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventLevel::Info),
            "progress" => Ok(EventLevel::Progress),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(format!("unknown event level: {other}")),
        }
    }
}

/// Input for enqueueing a job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub group: String,
    pub chat_id: String,
    pub prompt: String,
    /// `group` or `isolated`; the engine default applies when empty.
    pub context_mode: Option<String>,
    pub timeout_ms: Option<i64>,
    pub max_tool_steps: Option<u32>,
    pub tool_policy: Option<serde_json::Value>,
    pub model_override: Option<String>,
    pub priority: i64,
    pub tags: Vec<String>,
    pub parent_trace_id: Option<String>,
}

/// A persisted background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: String,
    pub group: String,
    pub chat_id: String,
    pub prompt: String,
    pub context_mode: String,
    pub status: JobStatus,
    pub timeout_ms: Option<i64>,
    pub max_tool_steps: Option<u32>,
    pub tool_policy_json: Option<String>,
    pub model_override: Option<String>,
    pub priority: i64,
    pub tags: Vec<String>,
    pub parent_trace_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Non-null iff status is `running`.
    pub lease_expires_at: Option<i64>,
    pub last_error: Option<String>,
    pub result_summary: Option<String>,
    /// Group-relative path of the spilled full result, when truncated.
    pub output_path: Option<String>,
    pub output_truncated: bool,
}

/// Append-only log row for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub level: EventLevel,
    pub message: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        for s in [
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::TimedOut,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["queued", "running", "succeeded", "failed", "canceled", "timed_out"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().to_string(), s);
        }
    }
}
