use crate::error::{AppError, AppResult};
use crate::retry::RetryPolicy;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Proxy behaviour loaded from the JSON file named by `LLMRELAY_CONFIG`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    #[serde(default)]
    pub path_rewrites: Vec<PathRewriteRule>,
    /// Time allowed until upstream response headers arrive, per attempt.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub provider_routes: Vec<ProviderRouteRule>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub banner: BannerConfig,
    #[serde(default)]
    pub model_limits: ModelLimitsConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: default_upstream_base_url(),
            path_rewrites: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryPolicy::default(),
            provider_routes: Vec::new(),
            auth: AuthConfig::default(),
            banner: BannerConfig::default(),
            model_limits: ModelLimitsConfig::default(),
            trace: TraceConfig::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_read_failed",
                format!("{}: {}", path.display(), err),
            )
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> AppResult<Self> {
        serde_json::from_str(text).map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_invalid",
                err.to_string(),
            )
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathRewriteRule {
    pub from_prefix: String,
    pub to_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRouteRule {
    /// Regular expression matched against the request's `model`.
    pub model_pattern: String,
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub required_prefix: Option<String>,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    /// When set, this key is sent upstream instead of the caller's token.
    #[serde(default)]
    pub upstream_api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required_prefix: None,
            min_token_len: default_min_token_len(),
            upstream_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BannerMode {
    #[default]
    None,
    Static,
    Credits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BannerConfig {
    #[serde(default)]
    pub mode: BannerMode,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_credits_path")]
    pub credits_path: String,
    #[serde(default = "default_banner_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            mode: BannerMode::None,
            text: None,
            credits_path: default_credits_path(),
            timeout_ms: default_banner_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelLimitEntry {
    pub model: String,
    pub max_context_tokens: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ModelLimitsConfig {
    #[serde(default)]
    pub models: Vec<ModelLimitEntry>,
    #[serde(default)]
    pub default_context_tokens: Option<u64>,
    /// Periodic refresh from the upstream models listing; disabled when unset.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    #[serde(default = "default_models_path")]
    pub models_path: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceSinkKind {
    #[default]
    None,
    Log,
    Http,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    #[serde(default)]
    pub sink: TraceSinkKind,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_upstream_base_url() -> String {
    "https://openrouter.ai".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_min_token_len() -> usize {
    12
}

fn default_credits_path() -> String {
    "/api/v1/credits".to_string()
}

fn default_banner_timeout_ms() -> u64 {
    2_000
}

fn default_models_path() -> String {
    "/api/v1/models".to_string()
}
