use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use troupe_core::{ModelKind, Provider};
use troupe_providers::{
    ConfiguredResolver, ModelChoice, OllamaProvider, OpenAiProvider, ToolSupportPolicy,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub tool_support: ToolSupportPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    /// "hosted" (OpenAI-compatible API) or "self-hosted" (local
    /// Ollama-style server). Inferred from the name and base URL when omitted.
    #[serde(default)]
    pub kind: Option<String>,

    /// API key. Supports $VAR and ${VAR} expansion.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,
}

/// Provider/model pairing per model kind. Kinds without an entry fall back
/// to the `text` pairing at resolution time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub text: Option<ModelEntry>,

    #[serde(default)]
    pub long_text: Option<ModelEntry>,

    #[serde(default)]
    pub image_to_text: Option<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Provider name (references [providers.X])
    pub provider: String,

    /// Model name; falls back to the provider's default_model
    #[serde(default)]
    pub model: Option<String>,
}

/// Expand $VAR and ${VAR} environment references. Unset variables are left
/// untouched.
fn expand_env(value: &str) -> String {
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
    re.replace_all(value, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

/// Resolve the provider kind from explicit config, provider name, or base URL.
///
/// Priority:
/// 1. Explicit `kind` in the provider entry always wins
/// 2. Names containing "ollama" are treated as self-hosted
/// 3. Base URLs pointing at the local machine are treated as self-hosted
/// 4. Everything else defaults to a hosted OpenAI-compatible API
fn resolve_provider_kind(
    explicit: Option<&str>,
    name: &str,
    base_url: Option<&str>,
) -> &'static str {
    match explicit {
        Some("self-hosted") | Some("self_hosted") => return "self-hosted",
        Some("hosted") => return "hosted",
        Some(other) => {
            warn!(kind = other, provider = name, "unknown provider kind, assuming hosted");
            return "hosted";
        }
        None => {}
    }
    if name.to_lowercase().contains("ollama") {
        return "self-hosted";
    }
    if let Some(url) = base_url {
        if url.contains("localhost") || url.contains("127.0.0.1") {
            return "self-hosted";
        }
    }
    "hosted"
}

fn build_provider(name: &str, entry: &ProviderEntry) -> Result<Arc<dyn Provider>> {
    let kind = resolve_provider_kind(entry.kind.as_deref(), name, entry.base_url.as_deref());
    let api_key = entry
        .api_key
        .as_deref()
        .map(expand_env)
        .or_else(|| std::env::var(format!("{}_API_KEY", name.to_uppercase())).ok());
    let base_url = entry.base_url.as_deref().map(expand_env);

    if kind == "self-hosted" {
        let mut provider = OllamaProvider::new().with_name(name);
        if let Some(url) = base_url {
            provider = provider.with_base_url(url);
        }
        if let Some(key) = api_key {
            provider = provider.with_api_key(key);
        }
        if let Some(model) = &entry.default_model {
            provider = provider.with_default_model(model);
        }
        return Ok(Arc::new(provider));
    }

    let api_key = api_key.with_context(|| {
        format!(
            "API key not found for provider '{}'. Configure it in \
             ~/.config/troupe/config.toml or set {}_API_KEY",
            name,
            name.to_uppercase()
        )
    })?;
    let mut provider = OpenAiProvider::new(api_key).with_name(name);
    if let Some(url) = base_url {
        provider = provider.with_base_url(url);
    }
    if let Some(model) = &entry.default_model {
        provider = provider.with_default_model(model);
    }
    Ok(Arc::new(provider))
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            anyhow::bail!(
                "No configuration found. Create ~/.config/troupe/config.toml with at least:\n\n\
                 [providers.openai]\n\
                 api_key = \"sk-...\"\n\n\
                 [models]\n\
                 text = {{ provider = \"openai\", model = \"gpt-4o-mini\" }}\n"
            )
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("troupe").join("config.toml"))
    }

    /// Apply command line overrides to the text model pairing.
    pub fn apply_overrides(&mut self, provider: Option<&str>, model: Option<&str>) -> Result<()> {
        match (provider, model) {
            (None, None) => {}
            (Some(provider), model) => {
                self.models.text = Some(ModelEntry {
                    provider: provider.to_string(),
                    model: model.map(str::to_string),
                });
            }
            (None, Some(model)) => {
                let entry = self.models.text.as_mut().with_context(|| {
                    format!("--model {} given but [models] has no text entry", model)
                })?;
                entry.model = Some(model.to_string());
            }
        }
        Ok(())
    }

    /// Build the model resolver backed by every configured provider.
    pub fn build_resolver(&self) -> Result<ConfiguredResolver> {
        if self.models.text.is_none() {
            anyhow::bail!("No text model configured. Add a [models] section with a text entry");
        }

        let mut resolver = ConfiguredResolver::new().with_policy(self.tool_support.clone());
        for (name, entry) in &self.providers {
            resolver = resolver.with_provider(name.clone(), build_provider(name, entry)?);
        }

        let kinds = [
            (ModelKind::Text, &self.models.text),
            (ModelKind::LongText, &self.models.long_text),
            (ModelKind::ImageToText, &self.models.image_to_text),
        ];
        for (kind, entry) in kinds {
            let Some(entry) = entry else { continue };
            resolver = resolver.with_model(kind, self.resolve_choice(entry)?);
        }
        Ok(resolver)
    }

    fn resolve_choice(&self, entry: &ModelEntry) -> Result<ModelChoice> {
        let provider = self.providers.get(&entry.provider).with_context(|| {
            format!("Model entry references unknown provider '{}'", entry.provider)
        })?;
        let model = entry
            .model
            .clone()
            .or_else(|| provider.default_model.clone())
            .with_context(|| {
                format!(
                    "No model named for provider '{}' and it has no default_model",
                    entry.provider
                )
            })?;
        Ok(ModelChoice::new(entry.provider.clone(), model))
    }
}
