//! Provider registry: named backend descriptors and model resolution.
//!
//! The registry is an explicit object injected into the orchestration engine;
//! there is no ambient global state. Replacing the registry (config reload)
//! swaps an immutable snapshot, so concurrent readers always see a complete
//! consistent view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, LlmError};
use crate::llm::anthropic::{AnthropicProvider, AnthropicSettings};
use crate::llm::ollama::{OllamaProvider, OllamaSettings};
use crate::llm::openai::{OpenAiProvider, OpenAiSettings};
use crate::llm::provider::{Capabilities, LlmProvider};

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ollama,
    #[serde(alias = "deepseek")]
    OpenAi,
    Anthropic,
}

/// Model naming tables for one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTable {
    /// Model used when a request names none.
    #[serde(default)]
    pub default: Option<String>,
    /// Short name -> concrete model identifier.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// When set, only these concrete models (plus alias targets) are allowed.
    #[serde(default)]
    pub list: Option<Vec<String>>,
    /// Models to try, in order, when a call to this backend fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// A validated backend configuration.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub protocol: Protocol,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub models: ModelTable,
    pub capabilities: Capabilities,
    /// Context window in tokens, used for compaction budgeting.
    pub context_window: usize,
    pub timeout: Duration,
}

impl BackendDescriptor {
    /// Minimal descriptor for a backend, used mostly by tests.
    pub fn new(name: impl Into<String>, protocol: Protocol, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol,
            base_url: base_url.into(),
            api_key: None,
            models: ModelTable::default(),
            capabilities: Capabilities::default(),
            context_window: 32_768,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.models.default = Some(model.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.aliases.insert(alias.into(), model.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.models.fallbacks = fallbacks;
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }
}

/// A resolved (backend, concrete model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedModel {
    pub provider: String,
    pub model: String,
}

impl std::fmt::Display for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

struct BackendEntry {
    descriptor: BackendDescriptor,
    provider: Arc<dyn LlmProvider>,
}

struct RegistryInner {
    /// Registration order; the first entry is the default provider.
    order: Vec<String>,
    backends: HashMap<String, BackendEntry>,
}

/// Registry of named backends with alias resolution and atomic reload.
pub struct ProviderRegistry {
    inner: RwLock<Arc<RegistryInner>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("registry lock poisoned");
        f.debug_struct("ProviderRegistry")
            .field("order", &inner.order)
            .finish()
    }
}

/// Summary of one backend for model listings.
#[derive(Debug, Clone)]
pub struct BackendOverview {
    pub name: String,
    pub protocol: Protocol,
    pub default_model: Option<String>,
    pub aliases: Vec<(String, String)>,
    pub fallbacks: Vec<String>,
}

impl ProviderRegistry {
    /// Build a registry from descriptors, constructing one adapter per entry.
    pub fn from_descriptors(descriptors: Vec<BackendDescriptor>) -> Result<Self, ConfigError> {
        let parts = descriptors
            .into_iter()
            .map(|d| {
                let provider = build_provider(&d);
                (d, provider)
            })
            .collect();
        Self::from_parts(parts)
    }

    /// Build a registry from (descriptor, adapter) pairs.
    ///
    /// Tests use this to register scripted providers.
    pub fn from_parts(
        parts: Vec<(BackendDescriptor, Arc<dyn LlmProvider>)>,
    ) -> Result<Self, ConfigError> {
        let inner = build_inner(parts)?;
        Ok(Self {
            inner: RwLock::new(Arc::new(inner)),
        })
    }

    /// Atomically replace the whole registry (config reload).
    pub fn replace(
        &self,
        parts: Vec<(BackendDescriptor, Arc<dyn LlmProvider>)>,
    ) -> Result<(), ConfigError> {
        let inner = build_inner(parts)?;
        let mut guard = self.inner.write().expect("registry lock poisoned");
        *guard = Arc::new(inner);
        Ok(())
    }

    fn snapshot(&self) -> Arc<RegistryInner> {
        Arc::clone(&self.inner.read().expect("registry lock poisoned"))
    }

    /// Name of the first-registered (default) provider.
    pub fn default_provider(&self) -> String {
        self.snapshot().order[0].clone()
    }

    /// Resolve a model reference to exactly one (backend, concrete model).
    ///
    /// Resolution order: explicit `provider/` prefix, then the chosen
    /// provider's alias table, then its default model. Without a prefix the
    /// first-registered provider is used. Fails with `UnknownModel` when the
    /// name is not an alias, violates a configured allow-list, or is not a
    /// syntactically plausible raw model identifier.
    pub fn resolve(&self, model_ref: Option<&str>) -> Result<ResolvedModel, LlmError> {
        let inner = self.snapshot();
        let (provider_name, bare) = match model_ref {
            None | Some("") => (inner.order[0].clone(), None),
            Some(reference) => {
                let (prefix, name) = split_provider_prefix(reference);
                match prefix.and_then(|p| find_provider(&inner, p)) {
                    Some(real) => (real, some_nonempty(name)),
                    // No prefix, or a prefix that names no provider: the
                    // whole reference is a model on the default provider
                    None => (inner.order[0].clone(), some_nonempty(reference)),
                }
            }
        };

        let entry = inner
            .backends
            .get(&provider_name)
            .expect("ordered name always present");
        let table = &entry.descriptor.models;

        let requested = match bare {
            Some(name) => name.to_string(),
            None => table
                .default
                .clone()
                .ok_or_else(|| LlmError::UnknownModel {
                    provider: provider_name.clone(),
                    model: "(default)".to_string(),
                })?,
        };

        let concrete = resolve_alias(table, &requested);

        if let Some(allowed) = &table.list {
            let permitted = allowed.iter().any(|m| m == &concrete)
                || table.default.as_deref() == Some(concrete.as_str());
            if !permitted {
                return Err(LlmError::UnknownModel {
                    provider: provider_name,
                    model: requested,
                });
            }
        } else if !is_raw_model_id(&concrete) {
            return Err(LlmError::UnknownModel {
                provider: provider_name,
                model: requested,
            });
        }

        Ok(ResolvedModel {
            provider: provider_name,
            model: concrete,
        })
    }

    /// Get the adapter for a backend by name.
    pub fn provider(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.snapshot()
            .backends
            .get(name)
            .map(|e| Arc::clone(&e.provider))
    }

    /// Provider-level fallback list for a backend.
    pub fn provider_fallbacks(&self, name: &str) -> Vec<String> {
        self.snapshot()
            .backends
            .get(name)
            .map(|e| e.descriptor.models.fallbacks.clone())
            .unwrap_or_default()
    }

    /// Context window configured for a backend.
    pub fn context_window(&self, name: &str) -> usize {
        self.snapshot()
            .backends
            .get(name)
            .map(|e| e.descriptor.context_window)
            .unwrap_or(32_768)
    }

    /// Per-backend model tables, for model listings.
    pub fn overview(&self) -> Vec<BackendOverview> {
        let inner = self.snapshot();
        inner
            .order
            .iter()
            .map(|name| {
                let entry = &inner.backends[name];
                let mut aliases: Vec<(String, String)> = entry
                    .descriptor
                    .models
                    .aliases
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                aliases.sort();
                BackendOverview {
                    name: name.clone(),
                    protocol: entry.descriptor.protocol,
                    default_model: entry.descriptor.models.default.clone(),
                    aliases,
                    fallbacks: entry.descriptor.models.fallbacks.clone(),
                }
            })
            .collect()
    }
}

fn build_provider(descriptor: &BackendDescriptor) -> Arc<dyn LlmProvider> {
    match descriptor.protocol {
        Protocol::Ollama => Arc::new(OllamaProvider::new(
            descriptor.name.clone(),
            OllamaSettings {
                base_url: descriptor.base_url.clone(),
                api_key: descriptor.api_key.clone(),
                capabilities: descriptor.capabilities,
                num_ctx: Some(descriptor.context_window as u32),
                timeout: descriptor.timeout,
            },
        )),
        Protocol::OpenAi => Arc::new(OpenAiProvider::new(
            descriptor.name.clone(),
            OpenAiSettings {
                base_url: descriptor.base_url.clone(),
                api_key: descriptor.api_key.clone(),
                capabilities: descriptor.capabilities,
                timeout: descriptor.timeout,
            },
        )),
        Protocol::Anthropic => Arc::new(AnthropicProvider::new(
            descriptor.name.clone(),
            AnthropicSettings {
                base_url: descriptor.base_url.clone(),
                api_key: descriptor.api_key.clone(),
                capabilities: descriptor.capabilities,
                timeout: descriptor.timeout,
            },
        )),
    }
}

fn build_inner(
    parts: Vec<(BackendDescriptor, Arc<dyn LlmProvider>)>,
) -> Result<RegistryInner, ConfigError> {
    if parts.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one provider must be configured".to_string(),
        ));
    }

    let mut order = Vec::with_capacity(parts.len());
    let mut backends = HashMap::with_capacity(parts.len());

    for (descriptor, provider) in parts {
        validate_descriptor(&descriptor)?;
        let key = descriptor.name.clone();
        if backends.contains_key(&key)
            || order
                .iter()
                .any(|n: &String| n.eq_ignore_ascii_case(&key))
        {
            return Err(ConfigError::Invalid(format!(
                "duplicate provider name '{}'",
                key
            )));
        }
        order.push(key.clone());
        backends.insert(key, BackendEntry { descriptor, provider });
    }

    Ok(RegistryInner { order, backends })
}

fn validate_descriptor(descriptor: &BackendDescriptor) -> Result<(), ConfigError> {
    if descriptor.name.trim().is_empty() {
        return Err(ConfigError::Invalid("provider name must not be empty".to_string()));
    }
    if descriptor.name.contains('/') || descriptor.name.contains(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!(
            "provider name '{}' must not contain '/' or whitespace",
            descriptor.name
        )));
    }
    if descriptor.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "provider '{}' has no base_url",
            descriptor.name
        )));
    }

    // Alias resolution must terminate: follow each chain with a visited set
    let table = &descriptor.models;
    for start in table.aliases.keys() {
        let mut seen = vec![start.as_str()];
        let mut current = start.as_str();
        while let Some(next) = table.aliases.get(current) {
            if seen.contains(&next.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' has an alias cycle involving '{}'",
                    descriptor.name, start
                )));
            }
            seen.push(next);
            current = next;
        }
    }

    if let Some(list) = &table.list {
        for model in list {
            if !is_raw_model_id(model) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' allow-list entry '{}' is not a model identifier",
                    descriptor.name, model
                )));
            }
        }
    }

    Ok(())
}

/// Follow the alias chain to a concrete model name. Cycles are excluded by
/// load-time validation, so this always terminates.
fn resolve_alias(table: &ModelTable, name: &str) -> String {
    let mut current = name;
    let mut hops = 0;
    while let Some(next) = table.aliases.get(current) {
        current = next;
        hops += 1;
        if hops > table.aliases.len() {
            break;
        }
    }
    current.to_string()
}

/// Split a `provider/model` reference. The prefix only counts as a provider
/// name when it contains no dot or colon (otherwise it is part of a model
/// path like `library/llama3:8b`).
fn split_provider_prefix(reference: &str) -> (Option<&str>, &str) {
    match reference.split_once('/') {
        Some((prefix, rest)) if !prefix.contains('.') && !prefix.contains(':') => {
            (Some(prefix), rest)
        }
        _ => (None, reference),
    }
}

/// Case-insensitive provider lookup returning the canonical key.
fn find_provider(inner: &RegistryInner, name: &str) -> Option<String> {
    if inner.backends.contains_key(name) {
        return Some(name.to_string());
    }
    inner
        .order
        .iter()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()
}

fn is_raw_model_id(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace)
}

fn some_nonempty(name: &str) -> Option<&str> {
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockProvider;

    fn registry() -> ProviderRegistry {
        let local = BackendDescriptor::new("local", Protocol::Ollama, "http://127.0.0.1:11434")
            .with_default_model("qwen3:14b")
            .with_alias("big", "llama3.3:70b")
            .with_alias("fast", "qwen3:4b");
        let cloud = BackendDescriptor::new("cloud", Protocol::OpenAi, "https://api.openai.com")
            .with_default_model("gpt-4o-mini")
            .with_alias("smart", "gpt-4o");
        ProviderRegistry::from_parts(vec![
            (local, MockProvider::named("local")),
            (cloud, MockProvider::named("cloud")),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_default_provider_default_model() {
        let reg = registry();
        let resolved = reg.resolve(None).unwrap();
        assert_eq!(resolved.provider, "local");
        assert_eq!(resolved.model, "qwen3:14b");
    }

    #[test]
    fn test_resolve_alias_without_prefix_uses_default_provider() {
        let reg = registry();
        let resolved = reg.resolve(Some("big")).unwrap();
        assert_eq!(resolved.provider, "local");
        assert_eq!(resolved.model, "llama3.3:70b");
    }

    #[test]
    fn test_resolve_with_provider_prefix() {
        let reg = registry();
        let resolved = reg.resolve(Some("cloud/smart")).unwrap();
        assert_eq!(resolved.provider, "cloud");
        assert_eq!(resolved.model, "gpt-4o");
    }

    #[test]
    fn test_prefix_with_empty_name_falls_back_to_provider_default() {
        let reg = registry();
        let resolved = reg.resolve(Some("cloud/")).unwrap();
        assert_eq!(resolved.provider, "cloud");
        assert_eq!(resolved.model, "gpt-4o-mini");
    }

    #[test]
    fn test_raw_model_id_passes_through() {
        let reg = registry();
        let resolved = reg.resolve(Some("mistral:7b")).unwrap();
        assert_eq!(resolved.provider, "local");
        assert_eq!(resolved.model, "mistral:7b");
    }

    #[test]
    fn test_dotted_prefix_is_not_a_provider() {
        let reg = registry();
        // "registry.io/model" must not be read as provider "registry.io"
        let resolved = reg.resolve(Some("registry.io/llama3:8b")).unwrap();
        assert_eq!(resolved.provider, "local");
        assert_eq!(resolved.model, "registry.io/llama3:8b");
    }

    #[test]
    fn test_unrecognized_prefix_treated_as_model_path() {
        let reg = registry();
        // "library" is no registered provider, so the whole reference is a
        // model name on the default provider
        let resolved = reg.resolve(Some("library/llama3:8b")).unwrap();
        assert_eq!(resolved.provider, "local");
        assert_eq!(resolved.model, "library/llama3:8b");
    }

    #[test]
    fn test_whitespace_name_rejected() {
        let reg = registry();
        let err = reg.resolve(Some("not a model")).unwrap_err();
        assert!(matches!(err, LlmError::UnknownModel { .. }));
    }

    #[test]
    fn test_allow_list_enforced() {
        let strict = BackendDescriptor::new("strict", Protocol::OpenAi, "https://api.openai.com")
            .with_default_model("gpt-4o-mini")
            .with_alias("smart", "gpt-4o");
        let mut strict = strict;
        strict.models.list = Some(vec!["gpt-4o".to_string()]);
        let reg =
            ProviderRegistry::from_parts(vec![(strict, MockProvider::named("strict"))]).unwrap();

        // Alias target is on the list
        assert!(reg.resolve(Some("smart")).is_ok());
        // Default model is always allowed
        assert!(reg.resolve(None).is_ok());
        // Arbitrary raw id is not
        let err = reg.resolve(Some("gpt-3.5-turbo")).unwrap_err();
        assert!(matches!(err, LlmError::UnknownModel { .. }));
    }

    #[test]
    fn test_alias_chain_resolves_through_hops() {
        let desc = BackendDescriptor::new("local", Protocol::Ollama, "http://x")
            .with_alias("small", "fast")
            .with_alias("fast", "qwen3:4b");
        let reg = ProviderRegistry::from_parts(vec![(desc, MockProvider::named("local"))]).unwrap();
        let resolved = reg.resolve(Some("small")).unwrap();
        assert_eq!(resolved.model, "qwen3:4b");
    }

    #[test]
    fn test_alias_cycle_rejected_at_load() {
        let desc = BackendDescriptor::new("local", Protocol::Ollama, "http://x")
            .with_alias("a", "b")
            .with_alias("b", "a");
        let err =
            ProviderRegistry::from_parts(vec![(desc, MockProvider::named("local"))]).unwrap_err();
        assert!(err.to_string().contains("alias cycle"));
    }

    #[test]
    fn test_duplicate_provider_names_rejected() {
        let a = BackendDescriptor::new("same", Protocol::Ollama, "http://x");
        let b = BackendDescriptor::new("SAME", Protocol::OpenAi, "http://y");
        let err = ProviderRegistry::from_parts(vec![
            (a, MockProvider::named("same")),
            (b, MockProvider::named("SAME")),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate provider name"));
    }

    #[test]
    fn test_replace_swaps_atomically() {
        let reg = registry();
        assert_eq!(reg.default_provider(), "local");

        let replacement =
            BackendDescriptor::new("only", Protocol::Ollama, "http://x").with_default_model("m");
        reg.replace(vec![(replacement, MockProvider::named("only"))])
            .unwrap();
        assert_eq!(reg.default_provider(), "only");
        assert!(reg.provider("local").is_none());
    }

    #[test]
    fn test_case_insensitive_prefix() {
        let reg = registry();
        let resolved = reg.resolve(Some("CLOUD/smart")).unwrap();
        assert_eq!(resolved.provider, "cloud");
    }

    #[test]
    fn test_overview_lists_backends_in_order() {
        let reg = registry();
        let overview = reg.overview();
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].name, "local");
        assert_eq!(overview[0].default_model.as_deref(), Some("qwen3:14b"));
        assert_eq!(overview[1].name, "cloud");
    }
}
