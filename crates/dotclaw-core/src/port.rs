use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the external collaborators behind the port traits.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Chat delivery failed: {0}")]
    Chat(String),

    #[error("Container run failed: {0}")]
    Container(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Provider-side handle for a sent message, used for later edits/deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef(pub String);

/// Outbound messaging surface of the host.
///
/// The real adapter (Telegram-like) lives outside this workspace; tests use
/// in-memory fakes. Implementations must be `Send + Sync` so one port can be
/// shared by the pipeline, the job engine, and the streaming deliverer.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<MessageRef, PortError>;

    async fn edit_message(
        &self,
        chat_id: &str,
        message: &MessageRef,
        text: &str,
    ) -> Result<(), PortError>;

    async fn delete_message(&self, chat_id: &str, message: &MessageRef) -> Result<(), PortError>;

    async fn send_file(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), PortError>;
}

/// Priority class of an agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Interactive,
    Scheduled,
    Maintenance,
}

impl Lane {
    /// Higher wins when picking the next queued run.
    pub fn priority(self) -> u8 {
        match self {
            Lane::Interactive => 3,
            Lane::Scheduled => 2,
            Lane::Maintenance => 1,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lane::Interactive => "interactive",
            Lane::Scheduled => "scheduled",
            Lane::Maintenance => "maintenance",
        };
        write!(f, "{s}")
    }
}

/// Reasoning effort requested from the model, downgraded on failover retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    High,
    Medium,
    Low,
    Off,
}

impl ReasoningEffort {
    /// One step down the ladder; `Off` stays `Off`.
    pub fn downgrade(self) -> Self {
        match self {
            ReasoningEffort::High => ReasoningEffort::Medium,
            ReasoningEffort::Medium => ReasoningEffort::Low,
            ReasoningEffort::Low | ReasoningEffort::Off => ReasoningEffort::Off,
        }
    }
}

/// Resource shape for the sandbox, forwarded verbatim to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub pids_limit: u32,
    pub memory: String,
    pub cpus: f64,
    pub read_only_root: bool,
    pub tmpfs_size: String,
    pub run_uid: u32,
    pub run_gid: u32,
}

impl From<&crate::config::ContainerConfig> for SandboxSpec {
    fn from(cfg: &crate::config::ContainerConfig) -> Self {
        Self {
            pids_limit: cfg.pids_limit,
            memory: cfg.memory.clone(),
            cpus: cfg.cpus,
            read_only_root: cfg.read_only_root,
            tmpfs_size: cfg.tmpfs_size.clone(),
            run_uid: cfg.run_uid,
            run_gid: cfg.run_gid,
        }
    }
}

/// One agent run handed to the sandboxed container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub group: String,
    pub chat_id: String,
    pub user_id: Option<String>,
    pub prompt: String,
    pub session_id: Option<String>,
    pub model: String,
    pub reasoning_effort: ReasoningEffort,
    pub max_tool_steps: u32,
    pub tool_allow: Option<Vec<String>>,
    pub tool_deny: Vec<String>,
    /// When set, the container streams partial output as chunk files here.
    pub stream_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    pub sandbox: SandboxSpec,
    pub trace_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Ok,
    Error,
}

/// What the container hands back when the agent process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOutput {
    pub status: ContainerStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Launches the sandboxed agent and waits for its terminal output.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn run(&self, req: ContainerRequest) -> Result<ContainerOutput, PortError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_downgrade_ladder() {
        assert_eq!(ReasoningEffort::High.downgrade(), ReasoningEffort::Medium);
        assert_eq!(ReasoningEffort::Medium.downgrade(), ReasoningEffort::Low);
        assert_eq!(ReasoningEffort::Low.downgrade(), ReasoningEffort::Off);
        assert_eq!(ReasoningEffort::Off.downgrade(), ReasoningEffort::Off);
    }

    #[test]
    fn container_output_tolerates_missing_fields() {
        let out: ContainerOutput = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(out.status, ContainerStatus::Ok);
        assert!(out.result.is_none());
        assert!(out.error.is_none());
    }
}
