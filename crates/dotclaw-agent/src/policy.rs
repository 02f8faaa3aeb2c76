//! Layered tool-policy resolution.
//!
//! Layers apply in order: built-in default ← config default ← group ← user
//! ← request overrides. Denies union across layers; allows intersect once
//! any layer has expressed an allowlist (a later layer can only narrow,
//! never widen).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use dotclaw_core::config::{PolicyLayer, ToolsConfig};

/// The resolved policy an agent run executes under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    /// `None` means every tool not denied is allowed.
    pub allow: Option<Vec<String>>,
    pub deny: Vec<String>,
    /// Per-run invocation budgets by tool name.
    pub budgets: HashMap<String, u32>,
}

impl ToolPolicy {
    /// Deny wins over allow; an absent allowlist permits everything else.
    pub fn allows(&self, tool: &str) -> bool {
        if self.deny.iter().any(|d| d == tool) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.iter().any(|a| a == tool),
            None => true,
        }
    }

    fn apply_layer(&mut self, allow: Option<&[String]>, deny: &[String]) {
        for d in deny {
            if !self.deny.contains(d) {
                self.deny.push(d.clone());
            }
        }
        if let Some(layer_allow) = allow {
            self.allow = Some(match self.allow.take() {
                // A prior layer already constrained the allowlist — intersect.
                Some(current) => current
                    .into_iter()
                    .filter(|t| layer_allow.contains(t))
                    .collect(),
                None => layer_allow.to_vec(),
            });
        }
    }
}

/// Merge the policy layers for `(group, user)` plus request overrides.
pub fn effective_tool_policy(
    cfg: &ToolsConfig,
    group: &str,
    user_id: Option<&str>,
    request_allow: Option<&[String]>,
    request_deny: &[String],
) -> ToolPolicy {
    let mut policy = ToolPolicy::default();

    let mut layers: Vec<&PolicyLayer> = vec![&cfg.default];
    if let Some(layer) = cfg.groups.get(group) {
        layers.push(layer);
    }
    if let Some(layer) = user_id.and_then(|u| cfg.users.get(u)) {
        layers.push(layer);
    }
    for layer in layers {
        policy.apply_layer(layer.allow.as_deref(), &layer.deny);
    }

    policy.apply_layer(request_allow, request_deny);
    policy.budgets = cfg.budgets.clone();
    policy
}

/// Per-run counters against the policy budgets.
#[derive(Debug, Default)]
pub struct ToolBudgetTracker {
    counts: HashMap<String, u32>,
}

impl ToolBudgetTracker {
    /// Record one invocation. Returns false when the tool's budget is spent;
    /// tools without a budget never exhaust.
    pub fn try_consume(&mut self, policy: &ToolPolicy, tool: &str) -> bool {
        let used = self.counts.entry(tool.to_string()).or_insert(0);
        match policy.budgets.get(tool) {
            Some(budget) if *used >= *budget => false,
            _ => {
                *used += 1;
                true
            }
        }
    }

    pub fn used(&self, tool: &str) -> u32 {
        self.counts.get(tool).copied().unwrap_or(0)
    }
}
