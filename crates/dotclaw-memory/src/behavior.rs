//! Personalized behavior config, projected from preference memories.
//!
//! Overlays are stored as conflict-keyed `preference` memories whose content
//! is a JSON object. The effective config layers base ← group overlay ←
//! user overlay; unknown keys are ignored and numeric biases are clamped to
//! [0, 1]. Projections are cached for five minutes per `(group, user)`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::MemoryStore;

/// Conflict key under which behavior overlays are stored.
pub const BEHAVIOR_CONFLICT_KEY: &str = "behavior";
/// Projection cache TTL.
pub const BEHAVIOR_CACHE_TTL_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    Concise,
    Balanced,
    Detailed,
}

/// Tunables the agent context carries into every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// 0 = answer from knowledge, 1 = reach for tools eagerly.
    pub tool_calling_bias: f64,
    /// Recall filter floor applied on top of the request min-score.
    pub memory_importance_threshold: f64,
    pub response_style: ResponseStyle,
    /// 0 = act autonomously, 1 = confirm before acting.
    pub caution_bias: f64,
    pub last_updated: Option<i64>,
    pub notes: Option<String>,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            tool_calling_bias: 0.5,
            memory_importance_threshold: 0.0,
            response_style: ResponseStyle::Balanced,
            caution_bias: 0.5,
            last_updated: None,
            notes: None,
        }
    }
}

impl BehaviorConfig {
    /// Apply one JSON overlay. Unknown keys are ignored; numerics clamp to
    /// [0, 1]; a malformed field leaves the previous value in place.
    pub fn apply_overlay(&mut self, overlay: &Value, now: i64) {
        let Some(map) = overlay.as_object() else { return };
        if let Some(v) = map.get("tool_calling_bias").and_then(Value::as_f64) {
            self.tool_calling_bias = v.clamp(0.0, 1.0);
        }
        if let Some(v) = map
            .get("memory_importance_threshold")
            .and_then(Value::as_f64)
        {
            self.memory_importance_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = map.get("response_style").and_then(Value::as_str) {
            match v {
                "concise" => self.response_style = ResponseStyle::Concise,
                "balanced" => self.response_style = ResponseStyle::Balanced,
                "detailed" => self.response_style = ResponseStyle::Detailed,
                _ => {}
            }
        }
        if let Some(v) = map.get("caution_bias").and_then(Value::as_f64) {
            self.caution_bias = v.clamp(0.0, 1.0);
        }
        if let Some(v) = map.get("notes").and_then(Value::as_str) {
            self.notes = Some(v.to_string());
        }
        self.last_updated = Some(now);
    }
}

impl MemoryStore {
    /// Effective behavior config for `(group, user)`: defaults, then the
    /// group overlay, then the user overlay. Cached for five minutes.
    pub fn behavior_config(
        &self,
        group: &str,
        user_id: Option<&str>,
        now: i64,
    ) -> Result<BehaviorConfig> {
        let cache_key = format!("{group}/{}", user_id.unwrap_or("-"));
        if let Some(cached) = self.behavior_cached(&cache_key, now) {
            return Ok(cached);
        }

        let mut config = BehaviorConfig::default();
        if let Some(overlay) = self.behavior_overlay(group, None)? {
            config.apply_overlay(&overlay, now);
        }
        if let Some(user) = user_id {
            if let Some(overlay) = self.behavior_overlay(group, Some(user))? {
                config.apply_overlay(&overlay, now);
            }
        }

        self.behavior_cache_put(&cache_key, &config, now);
        Ok(config)
    }

    fn behavior_overlay(&self, group: &str, user_id: Option<&str>) -> Result<Option<Value>> {
        let scope = if user_id.is_some() { "user" } else { "group" };
        let db = self.db_handle();
        let content: Option<String> = db
            .query_row(
                "SELECT content FROM memory_items
                 WHERE group_id = ?1 AND scope = ?2 AND subject_id IS ?3
                   AND type = 'preference' AND conflict_key = ?4
                 ORDER BY updated_at DESC LIMIT 1",
                rusqlite::params![group, scope, user_id, BEHAVIOR_CONFLICT_KEY],
                |row| row.get(0),
            )
            .ok();
        Ok(content.and_then(|c| serde_json::from_str(&c).ok()))
    }
}

/// Rule-based preference inference: maps free-text phrasing to a behavior
/// overlay. Pure function — `None` when nothing matches.
pub fn infer_preference_overlay(text: &str) -> Option<Value> {
    let lower = text.to_lowercase();
    let mut overlay = serde_json::Map::new();

    const CONCISE: &[&str] = &["keep it short", "be brief", "short answers", "less wordy"];
    const DETAILED: &[&str] = &["more detail", "in depth", "be thorough", "explain more"];
    const CAUTIOUS: &[&str] = &["double-check", "double check", "be careful", "ask before"];
    const BOLD: &[&str] = &["just do it", "don't ask", "go ahead without asking"];
    const TOOLS_ON: &[&str] = &["use your tools", "run the command", "check it yourself"];
    const TOOLS_OFF: &[&str] = &["don't run anything", "no commands", "just answer"];

    let hit = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    if hit(CONCISE) {
        overlay.insert("response_style".into(), "concise".into());
    } else if hit(DETAILED) {
        overlay.insert("response_style".into(), "detailed".into());
    }
    if hit(CAUTIOUS) {
        overlay.insert("caution_bias".into(), 0.8.into());
    } else if hit(BOLD) {
        overlay.insert("caution_bias".into(), 0.2.into());
    }
    if hit(TOOLS_ON) {
        overlay.insert("tool_calling_bias".into(), 0.8.into());
    } else if hit(TOOLS_OFF) {
        overlay.insert("tool_calling_bias".into(), 0.2.into());
    }

    if overlay.is_empty() {
        None
    } else {
        Some(Value::Object(overlay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryScope, MemoryType, MemoryUpsert};
    use rusqlite::Connection;

    fn store() -> MemoryStore {
        MemoryStore::new(Connection::open_in_memory().unwrap(), "main").unwrap()
    }

    fn behavior_upsert(scope: MemoryScope, subject: Option<&str>, json: &str) -> MemoryUpsert {
        MemoryUpsert {
            scope,
            subject_id: subject.map(str::to_string),
            mem_type: MemoryType::Preference,
            kind: None,
            conflict_key: Some(BEHAVIOR_CONFLICT_KEY.to_string()),
            content: json.to_string(),
            importance: 0.9,
            confidence: 0.9,
            tags: Vec::new(),
            ttl_days: None,
            source: None,
            metadata: None,
        }
    }

    #[test]
    fn overlay_clamps_and_ignores_unknown_keys() {
        let mut cfg = BehaviorConfig::default();
        cfg.apply_overlay(
            &serde_json::json!({
                "tool_calling_bias": 3.5,
                "caution_bias": -1.0,
                "response_style": "detailed",
                "galaxy_brain": true
            }),
            42,
        );
        assert_eq!(cfg.tool_calling_bias, 1.0);
        assert_eq!(cfg.caution_bias, 0.0);
        assert_eq!(cfg.response_style, ResponseStyle::Detailed);
        assert_eq!(cfg.last_updated, Some(42));
    }

    #[test]
    fn user_overlay_wins_over_group() {
        let s = store();
        s.upsert_batch(
            "main",
            &[behavior_upsert(
                MemoryScope::Group,
                None,
                r#"{"response_style":"concise","caution_bias":0.9}"#,
            )],
            1000,
        )
        .unwrap();
        s.upsert_batch(
            "main",
            &[behavior_upsert(
                MemoryScope::User,
                Some("alice"),
                r#"{"response_style":"detailed"}"#,
            )],
            1000,
        )
        .unwrap();

        let cfg = s.behavior_config("main", Some("alice"), 2000).unwrap();
        assert_eq!(cfg.response_style, ResponseStyle::Detailed);
        // Group layer still contributes where the user layer is silent.
        assert_eq!(cfg.caution_bias, 0.9);

        let cfg = s.behavior_config("main", Some("bob"), 2000).unwrap();
        assert_eq!(cfg.response_style, ResponseStyle::Concise);
    }

    #[test]
    fn projection_is_cached_within_ttl() {
        let s = store();
        let before = s.behavior_config("main", None, 1000).unwrap();

        s.upsert_batch(
            "main",
            &[behavior_upsert(
                MemoryScope::Group,
                None,
                r#"{"response_style":"concise"}"#,
            )],
            1500,
        )
        .unwrap();

        // Inside the TTL the stale projection is served.
        let cached = s.behavior_config("main", None, 2000).unwrap();
        assert_eq!(cached, before);

        // After the TTL the overlay shows up.
        let fresh = s
            .behavior_config("main", None, 1000 + BEHAVIOR_CACHE_TTL_MS + 1)
            .unwrap();
        assert_eq!(fresh.response_style, ResponseStyle::Concise);
    }

    #[test]
    fn inference_maps_phrases_to_biases() {
        let o = infer_preference_overlay("please keep it short and don't run anything").unwrap();
        assert_eq!(o["response_style"], "concise");
        assert_eq!(o["tool_calling_bias"], 0.2);
        assert!(infer_preference_overlay("what's the weather?").is_none());
    }
}
