use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreResult, ScopeError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    /// Base URL of the OpenAI-compatible provider, without the `/v1` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable that holds the process-wide API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            transcription_model: default_transcription_model(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

/// Filters applied to the upstream model listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModelsCfg {
    /// Regex an id must match to be listed.
    #[serde(default = "default_include")]
    pub include: String,
    /// Regex that removes an id from the listing.
    #[serde(default = "default_exclude")]
    pub exclude: String,
}

impl Default for ModelsCfg {
    fn default() -> Self {
        Self { include: default_include(), exclude: default_exclude() }
    }
}

fn default_include() -> String {
    "gpt".to_string()
}
fn default_exclude() -> String {
    "instruct|whisper|tts|embedding|moderation".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Unset by default: a total
    /// timeout would cut long completion streams.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub upstream: UpstreamCfg,
    #[serde(default)]
    pub models: ModelsCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ScopeError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ScopeError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ScopeError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| ScopeError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ScopeError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| ScopeError::Other(e.into())))?,
        };
        Ok(cfg)
    }
}

/// Process-wide defaults read from the environment once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
    pub api_key: Option<SecretString>,
}

impl EnvDefaults {
    pub fn from_env(cfg: &UpstreamCfg) -> Self {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(SecretString::from);
        Self { api_key }
    }

    pub fn with_api_key(key: &str) -> Self {
        Self { api_key: Some(SecretString::from(key.to_string())) }
    }
}
