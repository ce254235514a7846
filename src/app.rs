use crate::auth::{TokenFormatValidator, TokenValidator};
use crate::banner::{BannerSource, CreditsBanner, StaticBanner};
use crate::config::{BannerMode, ProxyConfig, TraceSinkKind};
use crate::error::{AppError, AppResult};
use crate::model_limits::{self, ModelLimits, ModelsEndpointSource};
use crate::retry::RetryPolicy;
use crate::trace_sink::{HttpTraceSink, LogTraceSink, TraceSink};
use crate::upstream::{self, ModelPatternRouting, ProviderRouting};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<ProxyConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub retry: Arc<RetryPolicy>,
    pub auth: Arc<dyn TokenValidator>,
    pub routing: Arc<dyn ProviderRouting>,
    pub banner: Option<Arc<dyn BannerSource>>,
    pub model_limits: ModelLimits,
    pub trace_sink: Option<Arc<dyn TraceSink>>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: Option<PathBuf>,
    /// Overrides `upstream_base_url` from the config file.
    pub upstream_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = non_empty_env("LLMRELAY_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            non_empty_env("LLMRELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        Self {
            listen,
            metrics_path,
            config_path: non_empty_env("LLMRELAY_CONFIG").map(PathBuf::from),
            upstream_url: non_empty_env("LLMRELAY_UPSTREAM_URL"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = match runtime.config_path.as_ref() {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    };
    load_state_with_config(runtime, config).await
}

pub async fn load_state_with_config(
    runtime: RuntimeConfig,
    mut config: ProxyConfig,
) -> AppResult<AppState> {
    if let Some(url) = runtime.upstream_url.as_ref() {
        config.upstream_base_url = url.clone();
    }
    upstream::upstream_authority(&config.upstream_base_url)?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("llmrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let routing = ModelPatternRouting::from_rules(&config.provider_routes).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "config_invalid",
            format!("provider route pattern: {err}"),
        )
    })?;

    let banner: Option<Arc<dyn BannerSource>> = match config.banner.mode {
        BannerMode::None => None,
        BannerMode::Static => config
            .banner
            .text
            .clone()
            .map(|text| Arc::new(StaticBanner::new(text)) as Arc<dyn BannerSource>),
        BannerMode::Credits => Some(Arc::new(CreditsBanner::new(
            http.clone(),
            upstream::join_url(&config.upstream_base_url, &config.banner.credits_path),
            Duration::from_millis(config.banner.timeout_ms),
        ))),
    };

    let trace_sink: Option<Arc<dyn TraceSink>> = match config.trace.sink {
        TraceSinkKind::None => None,
        TraceSinkKind::Log => Some(Arc::new(LogTraceSink)),
        TraceSinkKind::Http => {
            let url = config.trace.url.clone().ok_or_else(|| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "config_invalid",
                    "trace.url is required for the http trace sink",
                )
            })?;
            Some(Arc::new(HttpTraceSink::new(http.clone(), url)))
        }
    };

    let limits = &config.model_limits;
    let model_limits = ModelLimits::from_entries(&limits.models, limits.default_context_tokens);
    if let Some(secs) = limits.refresh_interval_secs.filter(|s| *s > 0) {
        let source = ModelsEndpointSource::new(
            http.clone(),
            upstream::join_url(&config.upstream_base_url, &limits.models_path),
        );
        model_limits::spawn_refresh(
            model_limits.clone(),
            Arc::new(source),
            Duration::from_secs(secs),
        );
    }

    let metrics = init_metrics()?;
    let auth = TokenFormatValidator::from_config(&config.auth);
    tracing::info!(
        upstream = %config.upstream_base_url,
        banner = ?config.banner.mode,
        trace_sink = ?config.trace.sink,
        max_retries = config.retry.max_attempts,
        "proxy configured"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        retry: Arc::new(config.retry.clone()),
        config: Arc::new(config),
        http,
        metrics,
        auth: Arc::new(auth),
        routing: Arc::new(routing),
        banner,
        model_limits,
        trace_sink,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let max_body_bytes = state.config.max_body_bytes;
    Router::<AppState>::new()
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::proxy)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static(crate::REQUEST_ID_HEADER),
        ))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static(crate::REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelLimitEntry;

    fn runtime() -> RuntimeConfig {
        RuntimeConfig {
            listen: "127.0.0.1:0".to_string(),
            metrics_path: "/metrics".to_string(),
            config_path: None,
            upstream_url: Some("http://127.0.0.1:9".to_string()),
        }
    }

    #[tokio::test]
    async fn runtime_url_overrides_config() {
        let state = load_state_with_config(runtime(), ProxyConfig::default())
            .await
            .unwrap();
        assert_eq!(state.config.upstream_base_url, "http://127.0.0.1:9");
        assert!(state.banner.is_none());
        assert!(state.trace_sink.is_none());
    }

    #[tokio::test]
    async fn collaborators_follow_config() {
        let mut config = ProxyConfig::default();
        config.banner.mode = BannerMode::Static;
        config.banner.text = Some("hello ".to_string());
        config.trace.sink = TraceSinkKind::Log;
        config.model_limits.models = vec![ModelLimitEntry {
            model: "openai/gpt-5".to_string(),
            max_context_tokens: 400_000,
        }];
        let state = load_state_with_config(runtime(), config).await.unwrap();
        assert!(state.banner.is_some());
        assert!(state.trace_sink.is_some());
        assert_eq!(state.model_limits.lookup("openai/gpt-5").await, Some(400_000));
    }

    #[tokio::test]
    async fn http_sink_without_url_is_rejected() {
        let mut config = ProxyConfig::default();
        config.trace.sink = TraceSinkKind::Http;
        let err = load_state_with_config(runtime(), config)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, "config_invalid");
    }

    #[tokio::test]
    async fn bad_route_pattern_is_rejected() {
        let mut config = ProxyConfig::default();
        config.provider_routes = vec![crate::config::ProviderRouteRule {
            model_pattern: "(".to_string(),
            provider: "X".to_string(),
        }];
        let err = load_state_with_config(runtime(), config)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, "config_invalid");
    }
}
