use std::env;

use kbgate_core::{ModelCatalog, ModelConfig};
use tracing::warn;

/// `(id, upstream model id, created)` for the stock model table.
pub const DEFAULT_MODELS: &[(&str, &str, i64)] = &[
    ("qwen", "1", 1_677_610_602),
    ("doubao", "2", 1_687_882_411),
    ("deepseek-r1", "3", 1_712_361_441),
    ("qwen2.5-vl-7b", "4", 1_712_361_441),
    ("deepseek-r1-local", "6", 1_712_361_441),
    ("deepseek-v3.1", "7", 1_712_361_441),
];
pub const DEFAULT_MODEL_OWNER: &str = "ulearning";
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I could not process your request. Please try again later.";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub login_url: String,
    pub chat_url: String,
    pub history_url: String,
    pub login_name: Option<String>,
    pub password: Option<String>,
    pub assistant_id: String,
    pub session_sign: String,
    pub ask_type: String,
    pub credential_cache_path: String,
    pub token_ttl_seconds: u64,
    pub login_timeout_seconds: u64,
    pub upstream_timeout_seconds: u64,
    pub fallback_message: String,
    pub models: Vec<ModelConfig>,
    pub default_model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid KB_PORT value: {0}")]
    InvalidPort(String),
    #[error("invalid {name} value: {value}")]
    InvalidSeconds { name: &'static str, value: String },
    #[error("KB_DEFAULT_MODEL '{0}' is not in the model table")]
    UnknownDefaultModel(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port_raw = env_or("KB_PORT", "8080");
        let port =
            port_raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidPort(port_raw.clone()))?;

        let config = Self {
            host: env_or("KB_HOST", "0.0.0.0"),
            port,
            login_url: env_or("KB_LOGIN_URL", "https://courseapi.ulearning.cn/users/login/v2"),
            chat_url: env_or("KB_CHAT_URL", "https://cloudsearchapi.ulearning.cn/kbChat/chat"),
            history_url: env_or(
                "KB_HISTORY_URL",
                "https://cloudsearchapi.ulearning.cn/kbChat/historyList",
            ),
            login_name: env_non_empty("KB_LOGIN_NAME"),
            password: env_non_empty("KB_PASSWORD"),
            assistant_id: env_or("KB_ASSISTANT_ID", "6"),
            session_sign: env_or("KB_SESSION_SIGN", "2"),
            ask_type: env_or("KB_ASK_TYPE", "1"),
            credential_cache_path: env_or("KB_CREDENTIAL_CACHE", "cache.json"),
            token_ttl_seconds: seconds_from_env("KB_TOKEN_TTL_SECONDS", 3600)?,
            login_timeout_seconds: seconds_from_env("KB_LOGIN_TIMEOUT", 10)?,
            upstream_timeout_seconds: seconds_from_env("KB_UPSTREAM_TIMEOUT", 120)?,
            fallback_message: env_or("KB_FALLBACK_MESSAGE", DEFAULT_FALLBACK_MESSAGE),
            models: parse_models(env::var("KB_MODELS").ok().as_deref().unwrap_or_default()),
            default_model: env_or("KB_DEFAULT_MODEL", "doubao"),
        };
        config.model_catalog()?;
        Ok(config)
    }

    pub fn model_catalog(&self) -> Result<ModelCatalog, ConfigError> {
        let fallback = self
            .models
            .iter()
            .find(|model| model.id == self.default_model)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDefaultModel(self.default_model.clone()))?;
        Ok(ModelCatalog::new(self.models.clone(), fallback))
    }

    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            login_url: "http://127.0.0.1:9/users/login/v2".to_string(),
            chat_url: "http://127.0.0.1:9/kbChat/chat".to_string(),
            history_url: "http://127.0.0.1:9/kbChat/historyList".to_string(),
            login_name: None,
            password: None,
            assistant_id: "6".to_string(),
            session_sign: "2".to_string(),
            ask_type: "1".to_string(),
            credential_cache_path: "cache.json".to_string(),
            token_ttl_seconds: 3600,
            login_timeout_seconds: 10,
            upstream_timeout_seconds: 120,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            models: default_models(),
            default_model: "doubao".to_string(),
        }
    }
}

pub fn default_models() -> Vec<ModelConfig> {
    DEFAULT_MODELS
        .iter()
        .map(|(id, upstream, created)| ModelConfig::new(id, upstream, *created, DEFAULT_MODEL_OWNER))
        .collect()
}

fn env_or(name: &str, default: &str) -> String {
    env_non_empty(name).unwrap_or_else(|| default.to_string())
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn seconds_from_env(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = env_non_empty(name) else {
        return Ok(default);
    };
    parse_positive_u64(&raw).ok_or(ConfigError::InvalidSeconds { name, value: raw })
}

fn parse_positive_u64(value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<u64>().ok()?;
    if parsed == 0 { None } else { Some(parsed) }
}

/// JSON array override for the model table; blank, invalid or empty input
/// keeps the stock table.
fn parse_models(raw: &str) -> Vec<ModelConfig> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return default_models();
    }
    match serde_json::from_str::<Vec<ModelConfig>>(trimmed) {
        Ok(models) if !models.is_empty() => models,
        _ => {
            warn!(
                event = "config.models.invalid",
                "KB_MODELS is not a valid model list, using the built-in table"
            );
            default_models()
        }
    }
}
