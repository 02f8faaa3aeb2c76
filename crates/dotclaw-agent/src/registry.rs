//! Model routing and capability lookup.
//!
//! Resolution precedence: per-user route → per-group route →
//! `routing.model` → `host.default_model`. Capabilities come from the
//! config catalog, with conservative fallbacks for unlisted models.

use std::collections::HashMap;

use serde::Serialize;

use dotclaw_core::config::{ModelEntry, RuntimeConfig};

/// Where a resolved model id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    User,
    Group,
    Routing,
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedModel {
    pub id: String,
    pub source: ModelSource,
}

pub struct ModelRegistry {
    catalog: HashMap<String, ModelEntry>,
    user_routes: HashMap<String, String>,
    group_routes: HashMap<String, String>,
    routing_model: Option<String>,
    default_model: String,
}

impl ModelRegistry {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            catalog: cfg
                .host
                .models
                .iter()
                .map(|m| (m.id.clone(), m.clone()))
                .collect(),
            user_routes: cfg.routing.users.clone(),
            group_routes: cfg.routing.groups.clone(),
            routing_model: cfg.routing.model.clone(),
            default_model: cfg.host.default_model.clone(),
        }
    }

    /// Resolve the model for `(group, user)`.
    pub fn resolve(&self, group: &str, user_id: Option<&str>) -> ResolvedModel {
        if let Some(id) = user_id.and_then(|u| self.user_routes.get(u)) {
            return ResolvedModel {
                id: id.clone(),
                source: ModelSource::User,
            };
        }
        if let Some(id) = self.group_routes.get(group) {
            return ResolvedModel {
                id: id.clone(),
                source: ModelSource::Group,
            };
        }
        if let Some(id) = &self.routing_model {
            return ResolvedModel {
                id: id.clone(),
                source: ModelSource::Routing,
            };
        }
        ResolvedModel {
            id: self.default_model.clone(),
            source: ModelSource::Default,
        }
    }

    /// Capability row for a model, falling back to conservative defaults for
    /// models missing from the catalog.
    pub fn capabilities(&self, model: &str) -> ModelEntry {
        self.catalog
            .get(model)
            .cloned()
            .unwrap_or_else(|| ModelEntry::fallback(model))
    }

    /// The failover chain starting from `primary`: the primary itself, then
    /// every other catalog model in declaration order.
    pub fn chain_from(&self, primary: &str, fallbacks: &[String]) -> Vec<String> {
        let mut chain = vec![primary.to_string()];
        chain.extend(fallbacks.iter().cloned());
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.host.default_model = "model-default".to_string();
        cfg.routing
            .groups
            .insert("ops".to_string(), "model-group".to_string());
        cfg.routing
            .users
            .insert("alice".to_string(), "model-alice".to_string());
        cfg.host.models.push(ModelEntry {
            id: "model-default".to_string(),
            context_length: 100_000,
            max_completion_tokens: 4_096,
        });
        cfg
    }

    #[test]
    fn precedence_user_group_routing_default() {
        let r = ModelRegistry::from_config(&config());
        let resolved = r.resolve("ops", Some("alice"));
        assert_eq!(resolved.id, "model-alice");
        assert_eq!(resolved.source, ModelSource::User);

        let resolved = r.resolve("ops", Some("bob"));
        assert_eq!(resolved.id, "model-group");
        assert_eq!(resolved.source, ModelSource::Group);

        let resolved = r.resolve("other", None);
        assert_eq!(resolved.id, "model-default");
        assert_eq!(resolved.source, ModelSource::Default);
    }

    #[test]
    fn routing_model_overrides_host_default() {
        let mut cfg = config();
        cfg.routing.model = Some("model-routed".to_string());
        let r = ModelRegistry::from_config(&cfg);
        let resolved = r.resolve("other", None);
        assert_eq!(resolved.id, "model-routed");
        assert_eq!(resolved.source, ModelSource::Routing);
        // User and group routes still win over the routing override.
        assert_eq!(r.resolve("ops", Some("alice")).id, "model-alice");
        assert_eq!(r.resolve("ops", None).id, "model-group");
    }

    #[test]
    fn capabilities_fall_back_for_unknown_models() {
        let r = ModelRegistry::from_config(&config());
        assert_eq!(r.capabilities("model-default").context_length, 100_000);
        let fallback = r.capabilities("model-mystery");
        assert_eq!(fallback.context_length, 200_000);
        assert_eq!(fallback.max_completion_tokens, 8_192);
    }
}
