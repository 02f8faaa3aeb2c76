//! Model-failover state machine: error classification, per-model cooldowns
//! with disk persistence, and next-model selection across a chain.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dotclaw_core::config::FailoverConfig;

/// Env var that disables cooldown persistence entirely.
pub const DISABLE_PERSISTENCE_ENV: &str = "DOTCLAW_DISABLE_FAILOVER_COOLDOWN_PERSISTENCE";
/// Real-clock floor: timestamps below this are fake clocks and must never
/// reach the persisted file.
const WALL_CLOCK_FLOOR_MS: i64 = 1_000_000_000_000;
/// At most this many cooldowns survive a persist, latest expiry first.
const MAX_PERSISTED_COOLDOWNS: usize = 128;
/// Cap on the compacted message inside a failover envelope.
const ENVELOPE_MESSAGE_MAX: usize = 240;

/// Minimum and maximum for the timeout-category cooldown clamp.
const TIMEOUT_COOLDOWN_MIN_MS: i64 = 15 * 60 * 1_000;
const TIMEOUT_COOLDOWN_MAX_MS: i64 = 6 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    RateLimit,
    Timeout,
    Overloaded,
    Transport,
    InvalidResponse,
    ContextOverflow,
    Aborted,
    NonRetryable,
}

impl ErrorCategory {
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::Timeout
                | ErrorCategory::Overloaded
                | ErrorCategory::Transport
                | ErrorCategory::InvalidResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Overloaded => "overloaded",
            ErrorCategory::Transport => "transport",
            ErrorCategory::InvalidResponse => "invalid_response",
            ErrorCategory::ContextOverflow => "context_overflow",
            ErrorCategory::Aborted => "aborted",
            ErrorCategory::NonRetryable => "non_retryable",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static CLASSIFIER: LazyLock<Vec<(Regex, ErrorCategory)>> = LazyLock::new(|| {
    // Order matters: the first hit wins.
    let table: &[(&str, ErrorCategory)] = &[
        (r"(?i)preempted|abort(ed)?( |_)?signal|operation was aborted", ErrorCategory::Aborted),
        (
            r"(?i)\b40[123]\b|unauthorized|forbidden|invalid (api )?key|authentication|insufficient[_ ]credit",
            ErrorCategory::Auth,
        ),
        (
            r"(?i)context[_ ](length|window|limit)|token limit|prompt is too long|maximum context",
            ErrorCategory::ContextOverflow,
        ),
        (r"(?i)\b429\b|rate[_ -]?limit|too many requests", ErrorCategory::RateLimit),
        (r"(?i)timed?[_ ]?out|timeout|deadline exceeded", ErrorCategory::Timeout),
        (
            r"(?i)\b50[0234]\b|overloaded|service unavailable|bad gateway|internal server error",
            ErrorCategory::Overloaded,
        ),
        (
            r"(?i)invalid json|unexpected token|parse error|malformed response|missing (done|result) sentinel|empty completion",
            ErrorCategory::InvalidResponse,
        ),
        (
            r"(?i)ECONNREFUSED|ECONNRESET|EAI_AGAIN|ENOTFOUND|connection (refused|reset|closed)|dns (error|failure)|socket hang ?up",
            ErrorCategory::Transport,
        ),
    ];
    table
        .iter()
        .map(|(pattern, category)| (Regex::new(pattern).unwrap(), *category))
        .collect()
});

/// Classify an error message. Unmatched text is `NonRetryable`.
pub fn classify_error(message: &str) -> ErrorCategory {
    for (re, category) in CLASSIFIER.iter() {
        if re.is_match(message) {
            return *category;
        }
    }
    ErrorCategory::NonRetryable
}

/// Cooldown length for a category. Zero means the model is not cooled.
pub fn cooldown_duration_ms(category: ErrorCategory, cfg: &FailoverConfig) -> i64 {
    match category {
        ErrorCategory::RateLimit => cfg.cooldown_rate_limit_ms,
        ErrorCategory::InvalidResponse => cfg.cooldown_invalid_response_ms,
        ErrorCategory::Timeout => (3 * cfg.cooldown_transient_ms)
            .clamp(TIMEOUT_COOLDOWN_MIN_MS, TIMEOUT_COOLDOWN_MAX_MS),
        ErrorCategory::Overloaded | ErrorCategory::Transport => cfg.cooldown_transient_ms,
        _ => 0,
    }
}

/// Structured error record emitted to observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEnvelope {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub source: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub message: String,
    pub timestamp: i64,
}

impl FailoverEnvelope {
    pub fn new(
        source: &str,
        attempt: u32,
        model: Option<&str>,
        raw_message: &str,
        now: i64,
    ) -> Self {
        let category = classify_error(raw_message);
        Self {
            category,
            retryable: category.retryable(),
            source: source.to_string(),
            attempt: attempt.max(1),
            model: model.map(str::to_string),
            status_code: extract_status_code(raw_message),
            message: compact_message(raw_message),
            timestamp: now,
        }
    }
}

static STATUS_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(4\d{2}|5\d{2})\b").unwrap());

fn extract_status_code(message: &str) -> Option<u16> {
    STATUS_CODE_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Collapse whitespace runs and truncate to the envelope cap.
fn compact_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len().min(ENVELOPE_MESSAGE_MAX));
    let mut last_space = false;
    for ch in message.chars() {
        let ch = if ch.is_whitespace() { ' ' } else { ch };
        if ch == ' ' && last_space {
            continue;
        }
        last_space = ch == ' ';
        out.push(ch);
        if out.len() >= ENVELOPE_MESSAGE_MAX {
            break;
        }
    }
    out.trim().to_string()
}

#[derive(Serialize, Deserialize)]
struct CooldownFile {
    version: u32,
    updated_at: String,
    model_cooldowns: HashMap<String, i64>,
}

struct CooldownState {
    map: HashMap<String, i64>,
    hydrated: bool,
}

/// Per-model cooldown registry with an optional on-disk mirror.
///
/// The file is the durable source across restarts, so the map lazy-hydrates
/// on first use. Writes go through temp-file + rename; a fake clock (below
/// the wall-clock floor) reads and serves cooldowns but never persists.
pub struct CooldownRegistry {
    state: Mutex<CooldownState>,
    path: Option<PathBuf>,
}

impl CooldownRegistry {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(CooldownState {
                map: HashMap::new(),
                hydrated: false,
            }),
            path,
        }
    }

    /// Put `model` on cooldown until `expires_at_ms`. A shorter new cooldown
    /// never truncates a longer existing one.
    pub fn note_cooldown(&self, model: &str, expires_at_ms: i64, now: i64) {
        let mut st = self.state.lock().unwrap();
        self.hydrate(&mut st);
        gc(&mut st.map, now);
        let entry = st.map.entry(model.to_string()).or_insert(0);
        if expires_at_ms > *entry {
            *entry = expires_at_ms;
        }
        debug!(model, expires_at_ms, "model cooldown noted");
        self.persist(&st.map, now);
    }

    /// Whether `model` is cooling at `now`. Expired entries are collected.
    pub fn is_cooling(&self, model: &str, now: i64) -> bool {
        let mut st = self.state.lock().unwrap();
        self.hydrate(&mut st);
        gc(&mut st.map, now);
        st.map.get(model).is_some_and(|exp| *exp > now)
    }

    /// Snapshot of active cooldowns.
    pub fn active(&self, now: i64) -> Vec<(String, i64)> {
        let mut st = self.state.lock().unwrap();
        self.hydrate(&mut st);
        gc(&mut st.map, now);
        let mut v: Vec<_> = st.map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1));
        v
    }

    fn hydrate(&self, st: &mut CooldownState) {
        if st.hydrated {
            return;
        }
        st.hydrated = true;
        let Some(ref path) = self.path else { return };
        let Ok(bytes) = std::fs::read(path) else { return };
        match serde_json::from_slice::<CooldownFile>(&bytes) {
            Ok(file) => {
                for (model, expires) in file.model_cooldowns {
                    let entry = st.map.entry(model).or_insert(0);
                    if expires > *entry {
                        *entry = expires;
                    }
                }
            }
            Err(e) => warn!(path = %path.display(), "unreadable cooldown file ignored: {e}"),
        }
    }

    fn persist(&self, map: &HashMap<String, i64>, now: i64) {
        let Some(ref path) = self.path else { return };
        if now < WALL_CLOCK_FLOOR_MS {
            return;
        }
        if std::env::var(DISABLE_PERSISTENCE_ENV).is_ok_and(|v| v == "1") {
            return;
        }

        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(MAX_PERSISTED_COOLDOWNS);

        let file = CooldownFile {
            version: 1,
            updated_at: chrono::Utc::now().to_rfc3339(),
            model_cooldowns: entries.into_iter().collect(),
        };
        let tmp = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
            std::fs::rename(&tmp, path)
        };
        if let Err(e) = write() {
            warn!(path = %path.display(), "cooldown persist failed: {e}");
        }
    }
}

fn gc(map: &mut HashMap<String, i64>, now: i64) {
    map.retain(|_, expires| *expires > now);
}

/// Next model to try: deduplicate the chain preserving order, drop models
/// in cooldown, skip already-attempted ones. Returns the pick plus the
/// remaining fallbacks, or `None` when the chain is exhausted.
pub fn choose_next_model(
    chain: &[String],
    attempted: &[String],
    cooldowns: &CooldownRegistry,
    now: i64,
) -> Option<(String, Vec<String>)> {
    let mut seen = std::collections::HashSet::new();
    let eligible: Vec<&String> = chain
        .iter()
        .filter(|m| seen.insert(m.as_str()))
        .filter(|m| !attempted.contains(m))
        .filter(|m| !cooldowns.is_cooling(m, now))
        .collect();
    let (first, rest) = eligible.split_first()?;
    Some(((*first).clone(), rest.iter().map(|m| (*m).clone()).collect()))
}

/// Tool-step budget downgrade applied on each failover retry.
pub fn downgrade_tool_steps(current: u32) -> u32 {
    ((current as f64 * 0.7) as u32).max(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_order_and_patterns() {
        assert_eq!(classify_error("request was preempted"), ErrorCategory::Aborted);
        assert_eq!(classify_error("HTTP 401 Unauthorized"), ErrorCategory::Auth);
        assert_eq!(classify_error("insufficient_credit"), ErrorCategory::Auth);
        assert_eq!(
            classify_error("prompt is too long: context_length exceeded"),
            ErrorCategory::ContextOverflow
        );
        assert_eq!(classify_error("429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(classify_error("deadline exceeded"), ErrorCategory::Timeout);
        assert_eq!(classify_error("503 Service Unavailable"), ErrorCategory::Overloaded);
        assert_eq!(
            classify_error("malformed response from provider"),
            ErrorCategory::InvalidResponse
        );
        assert_eq!(
            classify_error("connect ECONNREFUSED 127.0.0.1:8080"),
            ErrorCategory::Transport
        );
        assert_eq!(classify_error("the dog ate my prompt"), ErrorCategory::NonRetryable);
    }

    #[test]
    fn retryable_set_matches_taxonomy() {
        for c in [
            ErrorCategory::RateLimit,
            ErrorCategory::Timeout,
            ErrorCategory::Overloaded,
            ErrorCategory::Transport,
            ErrorCategory::InvalidResponse,
        ] {
            assert!(c.retryable());
        }
        for c in [
            ErrorCategory::Auth,
            ErrorCategory::ContextOverflow,
            ErrorCategory::Aborted,
            ErrorCategory::NonRetryable,
        ] {
            assert!(!c.retryable());
        }
    }

    #[test]
    fn cooldown_durations_per_category() {
        let cfg = FailoverConfig {
            max_retries: 3,
            cooldown_rate_limit_ms: 120_000,
            cooldown_transient_ms: 300_000,
            cooldown_invalid_response_ms: 600_000,
        };
        assert_eq!(cooldown_duration_ms(ErrorCategory::RateLimit, &cfg), 120_000);
        assert_eq!(
            cooldown_duration_ms(ErrorCategory::InvalidResponse, &cfg),
            600_000
        );
        // 3 * 300_000 = 900_000 — floored to 15 minutes.
        assert_eq!(cooldown_duration_ms(ErrorCategory::Timeout, &cfg), 900_000);
        assert_eq!(cooldown_duration_ms(ErrorCategory::Overloaded, &cfg), 300_000);
        assert_eq!(cooldown_duration_ms(ErrorCategory::Auth, &cfg), 0);

        // Huge transient cooldowns clamp at six hours.
        let big = FailoverConfig {
            cooldown_transient_ms: 100_000_000,
            ..cfg
        };
        assert_eq!(
            cooldown_duration_ms(ErrorCategory::Timeout, &big),
            TIMEOUT_COOLDOWN_MAX_MS
        );
    }

    #[test]
    fn chain_selection_respects_cooldowns_and_attempts() {
        let reg = CooldownRegistry::new(None);
        let chain = vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(), // duplicate — ignored
            "c".to_string(),
        ];
        let now = 1_000;

        let (pick, rest) = choose_next_model(&chain, &[], &reg, now).unwrap();
        assert_eq!(pick, "a");
        assert_eq!(rest, ["b", "c"]);

        reg.note_cooldown("b", now + 60_000, now);
        let (pick, rest) = choose_next_model(&chain, &["a".to_string()], &reg, now).unwrap();
        assert_eq!(pick, "c");
        assert!(rest.is_empty());

        // Everything attempted or cooling — exhausted.
        assert!(choose_next_model(
            &chain,
            &["a".to_string(), "c".to_string()],
            &reg,
            now
        )
        .is_none());

        // After the cooldown lapses, b is selectable again.
        assert_eq!(
            choose_next_model(&chain, &["a".to_string(), "c".to_string()], &reg, now + 61_000)
                .unwrap()
                .0,
            "b"
        );
    }

    #[test]
    fn chain_exhaustion_and_recovery_cycle() {
        let reg = CooldownRegistry::new(None);
        let cfg = FailoverConfig::default();
        let chain = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut attempted = Vec::new();
        let now = 1_000;

        // Every model fails overloaded in turn and cools down.
        for expect in ["a", "b", "c"] {
            let (pick, _) = choose_next_model(&chain, &attempted, &reg, now).unwrap();
            assert_eq!(pick, expect);
            let cooldown = cooldown_duration_ms(ErrorCategory::Overloaded, &cfg);
            reg.note_cooldown(&pick, now + cooldown, now);
            attempted.push(pick);
        }
        assert!(choose_next_model(&chain, &attempted, &reg, now).is_none());

        // A new request after the transient cooldown gets `a` again.
        let later = now + cfg.cooldown_transient_ms + 1;
        assert_eq!(choose_next_model(&chain, &[], &reg, later).unwrap().0, "a");
    }

    #[test]
    fn cooldowns_persist_via_rename_and_hydrate_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = WALL_CLOCK_FLOOR_MS + 1_000;

        let reg = CooldownRegistry::new(Some(path.clone()));
        reg.note_cooldown("model-x", now + 500_000, now);
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["model_cooldowns"]["model-x"], now + 500_000);

        // A fresh registry reads the file on first use.
        let reg2 = CooldownRegistry::new(Some(path));
        assert!(reg2.is_cooling("model-x", now));
        assert!(!reg2.is_cooling("model-x", now + 600_000));
    }

    #[test]
    fn fake_clock_never_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let reg = CooldownRegistry::new(Some(path.clone()));
        // Test-style small timestamps stay in memory only.
        reg.note_cooldown("model-x", 5_000, 1_000);
        assert!(reg.is_cooling("model-x", 2_000));
        assert!(!path.exists());
    }

    #[test]
    fn persisted_entries_cap_at_latest_128() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let now = WALL_CLOCK_FLOOR_MS + 1_000;
        let reg = CooldownRegistry::new(Some(path.clone()));
        for i in 0..150 {
            reg.note_cooldown(&format!("m{i}"), now + 1_000 + i, now);
        }
        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let map = parsed["model_cooldowns"].as_object().unwrap();
        assert_eq!(map.len(), 128);
        // The latest-expiring entry survives, the earliest does not.
        assert!(map.contains_key("m149"));
        assert!(!map.contains_key("m0"));
    }

    #[test]
    fn envelope_compacts_and_caps_message() {
        let raw = format!("  server   said\n\n 503 {} ", "x".repeat(400));
        let env = FailoverEnvelope::new("container", 0, Some("model-a"), &raw, 42);
        assert_eq!(env.category, ErrorCategory::Overloaded);
        assert!(env.retryable);
        assert_eq!(env.attempt, 1);
        assert_eq!(env.status_code, Some(503));
        assert!(env.message.len() <= 240);
        assert!(env.message.starts_with("server said 503"));
    }

    #[test]
    fn tool_step_downgrade_floors_at_eight() {
        assert_eq!(downgrade_tool_steps(40), 28);
        assert_eq!(downgrade_tool_steps(28), 19);
        assert_eq!(downgrade_tool_steps(10), 8);
        assert_eq!(downgrade_tool_steps(8), 8);
    }
}
