//! Configuration loading and validation.
//!
//! A JSON config file (default `~/.steward/config.json`) resolved at process
//! start into the provider registry, fallback lists, the context quota, and
//! the scheduler settings. Environment variables override file paths and
//! credentials. Malformed provider entries are rejected here, before any
//! call is attempted; hot reload is a full registry replacement between
//! requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::llm::{BackendDescriptor, Capabilities, ModelTable, Protocol};
use crate::scheduler::SchedulerConfig;

const CONFIG_DIR_ENV: &str = "STEWARD_CONFIG_DIR";
const DATA_DIR_ENV: &str = "STEWARD_DATA_DIR";

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";

/// One provider entry as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    #[serde(default)]
    pub base_url: Option<String>,
    /// May also come from `STEWARD_API_KEY_<NAME>`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: ModelTable,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub context_window: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatSettings {
    /// Share of the context window a request may occupy. Valid: 0.5–0.95.
    #[serde(default)]
    pub context_quota: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SubagentSettings {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Opaque policy text for delegated calls.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    providers: Vec<ProviderEntry>,
    #[serde(default)]
    fallbacks: Vec<String>,
    #[serde(default)]
    chat: ChatSettings,
    #[serde(default)]
    scheduler: SchedulerSettings,
    #[serde(default)]
    subagents: SubagentSettings,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub providers: Vec<ProviderEntry>,
    pub fallbacks: Vec<String>,
    pub context_quota: f64,
    pub scheduler: SchedulerConfig,
    pub subagents_enabled: bool,
    pub subagent_system_prompt: Option<String>,
    pub subagent_timeout: Duration,
    pub system_prompt: String,
    pub data_dir: PathBuf,
}

impl Config {
    /// Default config directory: `$STEWARD_CONFIG_DIR` or `~/.steward`.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".steward")
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from the given path, or the default location. A missing file
    /// yields the built-in defaults (one local Ollama provider).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let raw = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            serde_json::from_str::<RawConfig>(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            RawConfig::default()
        };
        Self::from_raw(raw)
    }

    /// Parse config from a JSON string (used by tests and validation).
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let raw = serde_json::from_str::<RawConfig>(content).map_err(|e| ConfigError::Parse {
            path: "(inline)".to_string(),
            reason: e.to_string(),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(mut raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.providers.is_empty() {
            raw.providers.push(ProviderEntry {
                name: "ollama".to_string(),
                protocol: Protocol::Ollama,
                base_url: None,
                api_key: None,
                models: ModelTable::default(),
                capabilities: Capabilities {
                    tools: true,
                    reasoning: true,
                    vision: false,
                },
                context_window: None,
                timeout_secs: None,
            });
        }

        let context_quota = raw.chat.context_quota.unwrap_or(0.85);
        if !(0.5..=0.95).contains(&context_quota) {
            return Err(ConfigError::Invalid(format!(
                "chat.context_quota must be between 0.5 and 0.95, got {}",
                context_quota
            )));
        }

        let poll_interval = Duration::from_secs(raw.scheduler.poll_interval_secs.unwrap_or(30));
        if poll_interval > Duration::from_secs(60) {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_secs must not exceed 60".to_string(),
            ));
        }

        let scheduler = SchedulerConfig {
            enabled: raw.scheduler.enabled.unwrap_or(false),
            poll_interval,
            attempt_timeout: Duration::from_secs(
                raw.scheduler.attempt_timeout_secs.unwrap_or(300),
            ),
            ..SchedulerConfig::default()
        };

        let data_dir = match std::env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => raw
                .data_dir
                .unwrap_or_else(|| Self::config_dir().join("data")),
        };

        Ok(Self {
            providers: raw.providers,
            fallbacks: raw.fallbacks,
            context_quota,
            scheduler,
            subagents_enabled: raw.subagents.enabled.unwrap_or(false),
            subagent_system_prompt: raw.subagents.system_prompt,
            subagent_timeout: Duration::from_secs(
                raw.subagents.attempt_timeout_secs.unwrap_or(300),
            ),
            system_prompt: raw.system_prompt.unwrap_or_default(),
            data_dir,
        })
    }

    /// Turn the provider entries into validated backend descriptors.
    ///
    /// API keys may come from `STEWARD_API_KEY_<NAME>` environment variables
    /// so credentials can stay out of the config file.
    pub fn backend_descriptors(&self) -> Result<Vec<BackendDescriptor>, ConfigError> {
        let env_keys: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("STEWARD_API_KEY_")
                    .map(|name| (name.to_lowercase(), v))
            })
            .collect();

        self.providers
            .iter()
            .map(|entry| {
                let base_url = entry.base_url.clone().unwrap_or_else(|| {
                    match entry.protocol {
                        Protocol::Ollama => DEFAULT_OLLAMA_URL,
                        Protocol::OpenAi => DEFAULT_OPENAI_URL,
                        Protocol::Anthropic => DEFAULT_ANTHROPIC_URL,
                    }
                    .to_string()
                });
                let api_key = entry
                    .api_key
                    .clone()
                    .or_else(|| env_keys.get(&entry.name.to_lowercase()).cloned())
                    .map(SecretString::from);

                Ok(BackendDescriptor {
                    name: entry.name.clone(),
                    protocol: entry.protocol,
                    base_url,
                    api_key,
                    models: entry.models.clone(),
                    capabilities: entry.capabilities,
                    context_window: entry.context_window.unwrap_or(32_768),
                    timeout: Duration::from_secs(entry.timeout_secs.unwrap_or(120)),
                })
            })
            .collect()
    }

    /// Make sure the data directory exists.
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| ConfigError::Io {
            path: self.data_dir.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name, "ollama");
        assert_eq!(config.context_quota, 0.85);
        assert!(!config.scheduler.enabled);
        assert!(!config.subagents_enabled);
    }

    #[test]
    fn test_full_config_parses() {
        let json = r#"{
            "providers": [
                {
                    "name": "local",
                    "type": "ollama",
                    "base_url": "http://10.0.0.5:11434",
                    "context_window": 16384,
                    "models": {
                        "default": "qwen3:14b",
                        "aliases": {"big": "llama3.3:70b"},
                        "fallbacks": ["qwen3:4b"]
                    }
                },
                {
                    "name": "cloud",
                    "type": "openai",
                    "api_key": "sk-test",
                    "models": {"default": "gpt-4o-mini"}
                }
            ],
            "fallbacks": ["cloud/gpt-4o-mini"],
            "chat": {"context_quota": 0.7},
            "scheduler": {"enabled": true, "poll_interval_secs": 20},
            "subagents": {"enabled": true}
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.context_quota, 0.7);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(20));
        assert_eq!(config.fallbacks, vec!["cloud/gpt-4o-mini".to_string()]);

        let descriptors = config.backend_descriptors().unwrap();
        assert_eq!(descriptors[0].base_url, "http://10.0.0.5:11434");
        assert_eq!(descriptors[0].context_window, 16_384);
        assert_eq!(descriptors[0].models.fallbacks, vec!["qwen3:4b".to_string()]);
        assert_eq!(descriptors[1].base_url, DEFAULT_OPENAI_URL);
        assert!(descriptors[1].api_key.is_some());
    }

    #[test]
    fn test_quota_out_of_range_rejected() {
        let err = Config::from_json(r#"{"chat": {"context_quota": 0.3}}"#).unwrap_err();
        assert!(err.to_string().contains("context_quota"));
        let err = Config::from_json(r#"{"chat": {"context_quota": 0.99}}"#).unwrap_err();
        assert!(err.to_string().contains("context_quota"));
    }

    #[test]
    fn test_poll_interval_capped_at_sixty() {
        let err =
            Config::from_json(r#"{"scheduler": {"poll_interval_secs": 120}}"#).unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));
    }

    #[test]
    fn test_deepseek_alias_maps_to_openai_protocol() {
        let json = r#"{
            "providers": [{"name": "ds", "type": "deepseek", "base_url": "https://api.deepseek.com"}]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.providers[0].protocol, Protocol::OpenAi);
    }

    #[test]
    fn test_malformed_provider_rejected() {
        let err = Config::from_json(r#"{"providers": [{"name": "x"}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
