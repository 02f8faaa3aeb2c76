use serde::{Deserialize, Serialize};

/// Visibility partition of a memory item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Private to one subject user within the group.
    User,
    /// Shared by everyone in the group.
    Group,
    /// Visible across all groups. Only the primary group may write it.
    Global,
}

impl std::fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryScope::User => "user",
            MemoryScope::Group => "group",
            MemoryScope::Global => "global",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MemoryScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MemoryScope::User),
            "group" => Ok(MemoryScope::Group),
            "global" => Ok(MemoryScope::Global),
            other => Err(format!("unknown memory scope: {other}")),
        }
    }
}

/// What the memory is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Identity,
    Preference,
    Fact,
    Relationship,
    Project,
    Task,
    Note,
    Archive,
}

impl MemoryType {
    /// Default cognitive kind when the caller does not specify one.
    pub fn default_kind(self) -> MemoryKind {
        match self {
            MemoryType::Preference => MemoryKind::Preference,
            MemoryType::Task | MemoryType::Project => MemoryKind::Procedural,
            _ => MemoryKind::Semantic,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryType::Identity => "identity",
            MemoryType::Preference => "preference",
            MemoryType::Fact => "fact",
            MemoryType::Relationship => "relationship",
            MemoryType::Project => "project",
            MemoryType::Task => "task",
            MemoryType::Note => "note",
            MemoryType::Archive => "archive",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "identity" => Ok(MemoryType::Identity),
            "preference" => Ok(MemoryType::Preference),
            "fact" => Ok(MemoryType::Fact),
            "relationship" => Ok(MemoryType::Relationship),
            "project" => Ok(MemoryType::Project),
            "task" => Ok(MemoryType::Task),
            "note" => Ok(MemoryType::Note),
            "archive" => Ok(MemoryType::Archive),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// How the memory was formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Semantic,
    Episodic,
    Procedural,
    Preference,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemoryKind::Semantic => "semantic",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Preference => "preference",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(MemoryKind::Semantic),
            "episodic" => Ok(MemoryKind::Episodic),
            "procedural" => Ok(MemoryKind::Procedural),
            "preference" => Ok(MemoryKind::Preference),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// A stored memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    /// Tenant namespace; `"global"` for primary-group global writes.
    pub group: String,
    pub scope: MemoryScope,
    /// Set iff `scope == User`.
    pub subject_id: Option<String>,
    pub mem_type: MemoryType,
    pub kind: MemoryKind,
    pub conflict_key: Option<String>,
    pub content: String,
    /// Lowercased, punctuation-stripped, space-collapsed content.
    pub normalized: String,
    pub importance: f64,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_accessed_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub source: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

/// One input to a batch upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUpsert {
    pub scope: MemoryScope,
    pub subject_id: Option<String>,
    pub mem_type: MemoryType,
    /// Defaults from `mem_type` when absent.
    pub kind: Option<MemoryKind>,
    pub conflict_key: Option<String>,
    pub content: String,
    pub importance: f64,
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub ttl_days: Option<i64>,
    pub source: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One recall hit with its blended score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f64,
}

/// Parameters for a hybrid recall pass.
#[derive(Debug, Clone)]
pub struct RecallRequest {
    pub group: String,
    pub user_id: Option<String>,
    pub query: String,
    pub max_results: usize,
    /// Token budget for the rendered recall lines.
    pub max_tokens: usize,
    pub min_score: f64,
}

/// What the context builder receives back from recall.
#[derive(Debug, Clone, Default)]
pub struct RecallOutcome {
    /// Rendered `"(<type>) <content>"` lines, in score order, within budget.
    pub lines: Vec<String>,
    pub hits: Vec<String>,
    pub estimated_tokens: usize,
}

/// Per-scope memory counts for a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub user: u64,
    pub group: u64,
    pub global: u64,
    pub total: u64,
}

/// Rough token estimate used for recall budgeting: one token per 4 bytes.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Lowercase, strip non-alphanumerics to spaces, collapse runs, trim.
pub fn normalize_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last_space = true;
    for ch in content.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
