//! Tool-support verdicts per provider/model pairing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use troupe_core::ProviderKind;

/// Decides whether a model can be trusted with tool definitions.
///
/// An explicit per-model override wins. Otherwise hosted providers are
/// assumed capable, and self-hosted models are matched by family substring:
/// deny-listed families never get tools, allow-listed ones do, and anything
/// unrecognized defaults to unsupported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSupportPolicy {
    /// Exact model name to forced verdict.
    pub overrides: HashMap<String, bool>,
    /// Self-hosted families known to handle tool calls.
    pub allow: Vec<String>,
    /// Self-hosted families known to break on tool calls.
    pub deny: Vec<String>,
}

impl Default for ToolSupportPolicy {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            allow: vec![
                "llama3".to_string(),
                "qwen".to_string(),
                "mistral".to_string(),
                "mixtral".to_string(),
            ],
            deny: vec![
                "deepseek-r1".to_string(),
                "llama2".to_string(),
                "codellama".to_string(),
                "vicuna".to_string(),
                "alpaca".to_string(),
            ],
        }
    }
}

impl ToolSupportPolicy {
    pub fn supports_tools(&self, kind: ProviderKind, model: &str) -> bool {
        if let Some(&verdict) = self.overrides.get(model) {
            return verdict;
        }
        match kind {
            ProviderKind::Hosted => true,
            ProviderKind::SelfHosted => {
                let model = model.to_lowercase();
                if self.deny.iter().any(|d| model.contains(&d.to_lowercase())) {
                    return false;
                }
                self.allow.iter().any(|a| model.contains(&a.to_lowercase()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosted_always_capable() {
        let policy = ToolSupportPolicy::default();
        assert!(policy.supports_tools(ProviderKind::Hosted, "anything-at-all"));
    }

    #[test]
    fn test_self_hosted_family_matching() {
        let policy = ToolSupportPolicy::default();
        assert!(policy.supports_tools(ProviderKind::SelfHosted, "llama3.1:70b"));
        assert!(policy.supports_tools(ProviderKind::SelfHosted, "Qwen2.5-Coder"));
        assert!(!policy.supports_tools(ProviderKind::SelfHosted, "codellama:13b"));
        assert!(!policy.supports_tools(ProviderKind::SelfHosted, "vicuna-7b"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = ToolSupportPolicy::default();
        // Distill names carry both a denied and an allowed family.
        assert!(!policy.supports_tools(ProviderKind::SelfHosted, "deepseek-r1-distill-qwen-7b"));
    }

    #[test]
    fn test_unrecognized_defaults_to_unsupported() {
        let policy = ToolSupportPolicy::default();
        assert!(!policy.supports_tools(ProviderKind::SelfHosted, "phi3:mini"));
    }

    #[test]
    fn test_override_beats_heuristic() {
        let mut policy = ToolSupportPolicy::default();
        policy.overrides.insert("phi3:mini".to_string(), true);
        policy.overrides.insert("gpt-4o".to_string(), false);

        assert!(policy.supports_tools(ProviderKind::SelfHosted, "phi3:mini"));
        assert!(!policy.supports_tools(ProviderKind::Hosted, "gpt-4o"));
    }
}
