//! Model resolution from configured providers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use troupe_core::{Error, ModelKind, ModelResolver, Provider, ResolvedModel};

use crate::policy::ToolSupportPolicy;

/// A provider name and model name pairing from configuration.
#[derive(Debug, Clone)]
pub struct ModelChoice {
    pub provider: String,
    pub model: String,
}

impl ModelChoice {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Resolver backed by a static provider registry and per-kind model choices.
/// Kinds without a dedicated choice fall back to the `Text` choice.
pub struct ConfiguredResolver {
    providers: HashMap<String, Arc<dyn Provider>>,
    models: HashMap<ModelKind, ModelChoice>,
    policy: ToolSupportPolicy,
}

impl ConfiguredResolver {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            models: HashMap::new(),
            policy: ToolSupportPolicy::default(),
        }
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    pub fn with_model(mut self, kind: ModelKind, choice: ModelChoice) -> Self {
        self.models.insert(kind, choice);
        self
    }

    pub fn with_policy(mut self, policy: ToolSupportPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for ConfiguredResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfiguredResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredResolver")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("models", &self.models)
            .field("policy", &self.policy)
            .finish()
    }
}

impl ModelResolver for ConfiguredResolver {
    fn resolve(&self, kind: ModelKind) -> Result<ResolvedModel, Error> {
        let choice = self
            .models
            .get(&kind)
            .or_else(|| {
                if kind != ModelKind::Text {
                    debug!(?kind, "no dedicated model configured, falling back to text");
                    self.models.get(&ModelKind::Text)
                } else {
                    None
                }
            })
            .ok_or_else(|| Error::model_not_found(format!("no model configured for {:?}", kind)))?;

        let provider = self
            .providers
            .get(&choice.provider)
            .ok_or_else(|| {
                Error::model_not_found(format!("provider '{}' is not configured", choice.provider))
            })?
            .clone();

        let supports_tools = self.policy.supports_tools(provider.kind(), &choice.model);

        Ok(ResolvedModel {
            provider,
            model: choice.model.clone(),
            supports_tools,
        })
    }
}
