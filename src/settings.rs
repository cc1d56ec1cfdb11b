use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7171";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LLM_MODE: &str = "upv";

pub const ENV_BASE_URL: &str = "TUTOR_BASE_URL";
pub const ENV_STORE_URL: &str = "TUTOR_STORE_URL";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "TUTOR_IDLE_TIMEOUT_SECS";
pub const ENV_LLM_MODE: &str = "TUTOR_LLM_MODE";

/// One layer of client configuration. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClientSettings {
    pub base_url: Option<String>,
    pub store_url: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub llm_mode: Option<String>,
}

impl ClientSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            base_url: non_empty(ENV_BASE_URL),
            store_url: non_empty(ENV_STORE_URL),
            idle_timeout_secs: non_empty(ENV_IDLE_TIMEOUT_SECS).and_then(|v| v.parse().ok()),
            llm_mode: non_empty(ENV_LLM_MODE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub base_url: String,
    pub store_url: Option<String>,
    pub idle_timeout: Duration,
    pub llm_mode: String,
}

pub fn resolve_effective_settings(env: &ClientSettings, cli: &ClientSettings) -> EffectiveSettings {
    let base_url = cli
        .base_url
        .clone()
        .or_else(|| env.base_url.clone())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let idle_secs = cli
        .idle_timeout_secs
        .or(env.idle_timeout_secs)
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

    EffectiveSettings {
        base_url: base_url.trim_end_matches('/').to_string(),
        store_url: cli.store_url.clone().or_else(|| env.store_url.clone()),
        idle_timeout: Duration::from_secs(idle_secs),
        llm_mode: cli
            .llm_mode
            .clone()
            .or_else(|| env.llm_mode.clone())
            .unwrap_or_else(|| DEFAULT_LLM_MODE.to_string()),
    }
}
