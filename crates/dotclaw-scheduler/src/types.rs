use serde::{Deserialize, Serialize};

/// Defines when and how often a task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron expression, evaluated in the task's timezone.
    Cron(String),
    /// Fire exactly once at the given timestamp (zone-aware parse).
    Once(String),
    /// Repeat every N milliseconds from the previous run.
    Interval(i64),
}

impl ScheduleSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleSpec::Cron(_) => "cron",
            ScheduleSpec::Once(_) => "once",
            ScheduleSpec::Interval(_) => "interval",
        }
    }

    pub fn value_string(&self) -> String {
        match self {
            ScheduleSpec::Cron(expr) => expr.clone(),
            ScheduleSpec::Once(at) => at.clone(),
            ScheduleSpec::Interval(ms) => ms.to_string(),
        }
    }

    pub fn from_columns(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "cron" => Some(ScheduleSpec::Cron(value.to_string())),
            "once" => Some(ScheduleSpec::Once(value.to_string())),
            "interval" => value.parse().ok().map(ScheduleSpec::Interval),
            _ => None,
        }
    }
}

/// Which conversation context a task run executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Share the group's live session.
    Group,
    /// Run against a snapshot so the live conversation is undisturbed.
    Isolated,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ContextMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "group" => Ok(ContextMode::Group),
            "isolated" => Ok(ContextMode::Isolated),
            other => Err(format!("unknown context mode: {other}")),
        }
    }
}

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    /// No future fire remains (exhausted schedule or retries).
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub group: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule: ScheduleSpec,
    pub context_mode: ContextMode,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: String,
}

/// A persisted scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group: String,
    pub chat_id: String,
    pub prompt: String,
    pub schedule: ScheduleSpec,
    pub context_mode: ContextMode,
    pub timezone: String,
    /// Epoch millis of the next planned fire; None when exhausted.
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
    pub last_result: Option<String>,
    /// Opaque JSON the agent may persist between runs.
    pub state: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One row of a task's run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub id: i64,
    pub task_id: String,
    pub run_at: i64,
    pub ok: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}
