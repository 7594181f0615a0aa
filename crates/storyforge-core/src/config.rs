//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level Storyforge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Temperature for the classification call (default: 0.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_temperature: Option<f64>,

    /// Number of recent conversation turns shown to the backend (default: 6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_window: Option<usize>,

    /// Follow-up suggestions returned per request, capped at 5.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_follow_ups: Option<usize>,

    /// Capacity of the per-request event channel (default: 64).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_buffer: Option<usize>,

    /// Supervisor transition budget before forcing wrap-up (default: 64).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,

    /// Longest wait for a backend answer, or between two streamed chunks (default: 120).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "storyforge_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::StoryforgeError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => {
                warn!(var = &caps[1], "Config references an unset environment variable");
                String::new()
            }
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        json5::from_str(&substituted)
            .map_err(|e| crate::error::StoryforgeError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    fn engine(&self) -> Option<&EngineConfig> {
        self.engine.as_ref()
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Model: engine override, then the first provider's default.
    pub fn default_model(&self) -> String {
        self.engine()
            .and_then(|e| e.model.clone())
            .or_else(|| self.first_provider().and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.engine().and_then(|e| e.max_tokens).unwrap_or(2048)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.engine().and_then(|e| e.temperature)
    }

    pub fn classifier_temperature(&self) -> f64 {
        self.engine()
            .and_then(|e| e.classifier_temperature)
            .unwrap_or(0.0)
    }

    pub fn history_window(&self) -> usize {
        self.engine().and_then(|e| e.history_window).unwrap_or(6)
    }

    pub fn max_follow_ups(&self) -> usize {
        self.engine()
            .and_then(|e| e.max_follow_ups)
            .unwrap_or(5)
            .min(5)
    }

    pub fn event_buffer(&self) -> usize {
        self.engine()
            .and_then(|e| e.event_buffer)
            .unwrap_or(64)
            .max(1)
    }

    pub fn max_steps(&self) -> usize {
        self.engine().and_then(|e| e.max_steps).unwrap_or(64)
    }

    pub fn request_timeout(&self) -> Duration {
        let secs = self
            .engine()
            .and_then(|e| e.request_timeout_secs)
            .unwrap_or(120)
            .max(1);
        Duration::from_secs(secs)
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    pub fn first_provider(&self) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.first())
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "engine.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match self.models.as_ref().and_then(|m| m.providers.as_ref()) {
            Some(providers) if !providers.is_empty() => {
                for p in providers {
                    if p.id != "ollama" && p.resolve_api_key().is_none() {
                        warnings.push(format!("Provider '{}' has no API key configured", p.id));
                    }
                }
            }
            _ => warnings.push("No providers configured".to_string()),
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(engine) = &self.engine {
            if engine.max_follow_ups.is_some_and(|n| n > 5) {
                warnings.push("engine.max_follow_ups is capped at 5".to_string());
            }
            if engine.event_buffer == Some(0) {
                errors.push("engine.event_buffer must be at least 1".to_string());
            }
            if engine.max_steps.is_some_and(|n| n < 4) {
                errors.push("engine.max_steps must be at least 4".to_string());
            }
            if engine.request_timeout_secs == Some(0) {
                errors.push("engine.request_timeout_secs must be at least 1".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Storyforge data: `~/.storyforge/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".storyforge")
}
