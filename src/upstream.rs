use crate::config::{PathRewriteRule, ProviderRouteRule, ProxyConfig};
use crate::error::{AppError, AppResult};
use crate::retry::{self, RetryPolicy};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Connection-level failure classes, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkFailure {
    Timeout,
    Reset,
    Refused,
    Dns,
    Aborted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network(NetworkFailure),
    Http,
    /// Raised after response headers were received.
    Stream,
    /// The outbound request could not be built.
    Request,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
    pub body: Option<String>,
    pub headers: HeaderMap,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn network(failure: NetworkFailure, message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Network(failure), None, message.into())
    }

    /// Non-2xx upstream answer with its drained body.
    pub fn http(status: StatusCode, body: String) -> Self {
        let code = extract_error_code(&body);
        let mut err = Self::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("upstream status {}: {}", status, body),
        );
        err.code = code;
        err.body = Some(body);
        err
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, UpstreamErrorKind::Network(NetworkFailure::Timeout))
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamBody {
    Json(Value),
    Raw(Bytes),
}

impl UpstreamBody {
    /// JSON objects become structured bodies so provider rewriting can apply;
    /// anything else is forwarded untouched.
    pub fn from_bytes(bytes: Bytes) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value @ Value::Object(_)) => Some(UpstreamBody::Json(value)),
            _ => Some(UpstreamBody::Raw(bytes)),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            UpstreamBody::Json(value) => Some(value),
            UpstreamBody::Raw(_) => None,
        }
    }

    fn to_bytes(&self) -> Result<Bytes, UpstreamCallError> {
        match self {
            UpstreamBody::Json(value) => serde_json::to_vec(value).map(Bytes::from).map_err(|err| {
                UpstreamCallError::new(UpstreamErrorKind::Request, None, err.to_string())
            }),
            UpstreamBody::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Immutable description of one outbound call. Additions produce a new value.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<UpstreamBody>,
    pub timeout: Duration,
    pub stream: bool,
    pub retry: Arc<RetryPolicy>,
}

impl UpstreamRequest {
    pub fn with_header(&self, name: HeaderName, value: HeaderValue) -> Self {
        let mut next = self.clone();
        next.headers.insert(name, value);
        next
    }

    pub fn model(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.as_json())
            .and_then(|v| v.get("model"))
            .and_then(|v| v.as_str())
    }
}

/// What the dispatcher needs from the inbound request.
pub struct InboundRequest<'a> {
    pub method: &'a Method,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<UpstreamBody>,
}

const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "upgrade",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "content-length",
    "proxy-authorization",
    "proxy-authenticate",
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-real-ip",
    "if-none-match",
    "if-modified-since",
    "if-match",
    "if-unmodified-since",
    "if-range",
    // Streams are rewritten byte-wise, so they must arrive identity-encoded.
    "accept-encoding",
];

pub fn is_dropped_request_header(name: &str) -> bool {
    name.starts_with(':')
        || DROPPED_REQUEST_HEADERS
            .iter()
            .any(|dropped| name.eq_ignore_ascii_case(dropped))
}

pub fn filter_request_headers(inbound: &HeaderMap, authority: &str) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_dropped_request_header(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if let Ok(host) = HeaderValue::from_str(authority) {
        out.insert(HOST, host);
    }
    out
}

pub fn map_path(path_and_query: &str, rules: &[PathRewriteRule]) -> String {
    for rule in rules {
        if let Some(rest) = path_and_query.strip_prefix(rule.from_prefix.as_str()) {
            return format!("{}{}", rule.to_prefix, rest);
        }
    }
    path_and_query.to_string()
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        } else if let Some(stripped) = path.strip_prefix("v1?") {
            return format!("{}?{}", base, stripped);
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

pub fn upstream_authority(base_url: &str) -> AppResult<String> {
    let url = reqwest::Url::parse(base_url).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream_url_invalid",
            err.to_string(),
        )
    })?;
    let host = url.host_str().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream_url_invalid",
            format!("upstream url has no host: {base_url}"),
        )
    })?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

pub fn is_stream_request(body: Option<&UpstreamBody>) -> bool {
    body.and_then(|b| b.as_json())
        .and_then(|v| v.get("stream"))
        .and_then(|v| v.as_bool())
        == Some(true)
}

/// Provider-specific request body rewriting.
pub trait ProviderRouting: Send + Sync {
    /// Returns true when the body was changed. Applying twice must equal
    /// applying once.
    fn apply(&self, body: &mut Value) -> bool;
}

/// Pins models whose id matches a pattern to one provider, unless the
/// caller already expressed a routing preference.
pub struct ModelPatternRouting {
    rules: Vec<(Regex, String)>,
}

impl ModelPatternRouting {
    pub fn from_rules(rules: &[ProviderRouteRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| Ok((Regex::new(&rule.model_pattern)?, rule.provider.clone())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    fn provider_for(&self, model: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(model))
            .map(|(_, provider)| provider.as_str())
    }
}

impl ProviderRouting for ModelPatternRouting {
    fn apply(&self, body: &mut Value) -> bool {
        let Some(obj) = body.as_object_mut() else {
            return false;
        };
        if obj.contains_key("provider") {
            return false;
        }
        let Some(model) = obj.get("model").and_then(|v| v.as_str()) else {
            return false;
        };
        let Some(provider) = self.provider_for(model) else {
            return false;
        };
        let hint = json!({ "order": [provider], "allow_fallbacks": false });
        obj.insert("provider".to_string(), hint);
        true
    }
}

pub fn build_upstream_request(
    config: &ProxyConfig,
    retry: Arc<RetryPolicy>,
    inbound: InboundRequest<'_>,
    forward_authorization: Option<HeaderValue>,
    request_id: &str,
) -> AppResult<UpstreamRequest> {
    let authority = upstream_authority(&config.upstream_base_url)?;
    let path = map_path(inbound.path_and_query, &config.path_rewrites);
    let url = join_url(&config.upstream_base_url, &path);

    let mut headers = filter_request_headers(inbound.headers, &authority);
    headers.remove(AUTHORIZATION);
    if let Some(value) = forward_authorization {
        headers.insert(AUTHORIZATION, value);
    }
    if matches!(inbound.body, Some(UpstreamBody::Json(_))) && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let stream = is_stream_request(inbound.body.as_ref());
    let req = UpstreamRequest {
        method: inbound.method.clone(),
        url,
        headers,
        body: inbound.body,
        timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
        stream,
        retry,
    };
    Ok(match HeaderValue::from_str(request_id) {
        Ok(value) => req.with_header(HeaderName::from_static(crate::REQUEST_ID_HEADER), value),
        Err(_) => req,
    })
}

/// Issues the request through the retry policy. Only the phase up to the
/// response headers is retried; the returned response body is untouched.
pub async fn dispatch(
    client: &reqwest::Client,
    req: &UpstreamRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    let policy = req.retry.clone();
    retry::execute(&policy, || send_once(client, req)).await
}

async fn send_once(
    client: &reqwest::Client,
    req: &UpstreamRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut builder = client
        .request(req.method.clone(), &req.url)
        .headers(req.headers.clone());
    if let Some(body) = req.body.as_ref() {
        builder = builder.body(body.to_bytes()?);
    }
    let deadline = tokio::time::Instant::now() + req.timeout;
    let resp = match tokio::time::timeout_at(deadline, builder.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            return Err(UpstreamCallError::network(
                retry::classify_reqwest_error(&err),
                err.to_string(),
            ));
        }
        Err(_) => {
            return Err(UpstreamCallError::network(
                NetworkFailure::Timeout,
                format!(
                    "no upstream response within {}ms",
                    req.timeout.as_millis()
                ),
            ));
        }
    };
    let status = resp.status();
    if !status.is_success() {
        let headers = resp.headers().clone();
        // The error body shares the header deadline; a stalled body still
        // yields a classified failure.
        let text = match tokio::time::timeout_at(deadline, resp.text()).await {
            Ok(text) => text.unwrap_or_default(),
            Err(_) => {
                tracing::debug!(status = %status, "upstream error body not received in time");
                String::new()
            }
        };
        return Err(UpstreamCallError::http(status, text).with_headers(headers));
    }
    Ok(resp)
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let code = value.get("error").and_then(|v| v.get("code"))?;
    match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn routing() -> ModelPatternRouting {
        ModelPatternRouting::from_rules(&[
            ProviderRouteRule {
                model_pattern: "^anthropic/".to_string(),
                provider: "Anthropic".to_string(),
            },
            ProviderRouteRule {
                model_pattern: "^openai/".to_string(),
                provider: "OpenAI".to_string(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn provider_routing_is_idempotent() {
        let routing = routing();
        let mut once = json!({"model": "anthropic/claude-sonnet-4", "stream": true});
        assert!(routing.apply(&mut once));
        let mut twice = once.clone();
        assert!(!routing.apply(&mut twice));
        assert_eq!(once, twice);
        assert_eq!(once["provider"]["order"], json!(["Anthropic"]));
        assert_eq!(once["provider"]["allow_fallbacks"], json!(false));
    }

    #[test]
    fn provider_routing_keeps_explicit_preference() {
        let routing = routing();
        let mut body = json!({"model": "openai/gpt-5", "provider": {"order": ["Azure"]}});
        let before = body.clone();
        assert!(!routing.apply(&mut body));
        assert_eq!(body, before);
    }

    #[test]
    fn provider_routing_ignores_unmatched_models() {
        let routing = routing();
        let mut body = json!({"model": "meta-llama/llama-4"});
        assert!(!routing.apply(&mut body));
        assert!(body.get("provider").is_none());
        let mut not_object = json!(["model"]);
        assert!(!routing.apply(&mut not_object));
    }

    #[test]
    fn hop_by_hop_and_conditional_headers_are_dropped() {
        let mut inbound = HeaderMap::new();
        for (k, v) in [
            ("host", "proxy.local"),
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("content-length", "12"),
            ("x-forwarded-for", "10.0.0.1"),
            ("x-forwarded-proto", "https"),
            ("if-none-match", "\"abc\""),
            ("if-modified-since", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("proxy-authorization", "Basic x"),
            ("accept-encoding", "gzip"),
            ("content-type", "application/json"),
            ("x-title", "my app"),
        ] {
            inbound.insert(
                HeaderName::from_static(k),
                HeaderValue::from_static(v),
            );
        }
        let out = filter_request_headers(&inbound, "openrouter.ai");
        assert_eq!(out.get("host").unwrap(), "openrouter.ai");
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-title").unwrap(), "my app");
        for dropped in [
            "connection",
            "transfer-encoding",
            "content-length",
            "x-forwarded-for",
            "x-forwarded-proto",
            "if-none-match",
            "if-modified-since",
            "proxy-authorization",
            "accept-encoding",
        ] {
            assert!(out.get(dropped).is_none(), "{dropped} leaked");
        }
        assert!(is_dropped_request_header(":authority"));
    }

    #[test]
    fn path_rewrite_uses_first_matching_prefix() {
        let rules = vec![
            PathRewriteRule {
                from_prefix: "/openrouter/".to_string(),
                to_prefix: "/api/".to_string(),
            },
            PathRewriteRule {
                from_prefix: "/v1/".to_string(),
                to_prefix: "/api/v1/".to_string(),
            },
        ];
        assert_eq!(
            map_path("/v1/chat/completions?x=1", &rules),
            "/api/v1/chat/completions?x=1"
        );
        assert_eq!(map_path("/openrouter/v1/models", &rules), "/api/v1/models");
        assert_eq!(map_path("/health", &rules), "/health");
    }

    #[test]
    fn join_url_does_not_double_version_segment() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://openrouter.ai", "/api/v1/chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn build_request_replaces_authorization_and_sets_host() {
        let config: ProxyConfig = serde_json::from_value(json!({
            "upstream_base_url": "http://127.0.0.1:9000",
            "request_timeout_ms": 1500
        }))
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        headers.insert(HOST, HeaderValue::from_static("proxy"));
        let body = UpstreamBody::from_bytes(Bytes::from_static(
            br#"{"model":"m","stream":true}"#,
        ));
        let req = build_upstream_request(
            &config,
            Arc::new(RetryPolicy::default()),
            InboundRequest {
                method: &Method::POST,
                path_and_query: "/api/v1/chat/completions",
                headers: &headers,
                body,
            },
            Some(HeaderValue::from_static("Bearer upstream")),
            "req-42",
        )
        .unwrap();
        assert_eq!(req.url, "http://127.0.0.1:9000/api/v1/chat/completions");
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer upstream");
        assert_eq!(req.headers.get(HOST).unwrap(), "127.0.0.1:9000");
        assert_eq!(req.headers.get("x-request-id").unwrap(), "req-42");
        assert_eq!(req.timeout, Duration::from_millis(1500));
        assert!(req.stream);
        assert_eq!(req.model(), Some("m"));

        let tagged = req.with_header(
            HeaderName::from_static("x-extra"),
            HeaderValue::from_static("1"),
        );
        assert!(req.headers.get("x-extra").is_none());
        assert_eq!(tagged.headers.get("x-extra").unwrap(), "1");
    }

    #[test]
    fn non_object_bodies_stay_raw() {
        assert!(UpstreamBody::from_bytes(Bytes::new()).is_none());
        assert!(matches!(
            UpstreamBody::from_bytes(Bytes::from_static(b"plain text")),
            Some(UpstreamBody::Raw(_))
        ));
        assert!(!is_stream_request(
            UpstreamBody::from_bytes(Bytes::from_static(br#"{"stream":"yes"}"#)).as_ref()
        ));
    }

    #[test]
    fn http_error_extracts_code() {
        let err = UpstreamCallError::http(
            StatusCode::PAYMENT_REQUIRED,
            r#"{"error":{"code":402,"message":"Insufficient credits"}}"#.to_string(),
        );
        assert_eq!(err.code.as_deref(), Some("402"));
        assert!(err.message.contains("Insufficient credits"));
    }
}
