use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::inject::{InjectionPolicy, StreamInjector, StreamState};
use crate::relay::{self, TraceContext};
use crate::trace_sink;
use crate::upstream::{self, InboundRequest, UpstreamBody};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Every path other than the metrics endpoint is proxied upstream.
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let request_id =
        extract_request_id(req.headers()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let span = tracing::info_span!(
        "proxy",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    match forward(state, req, &request_id).instrument(span).await {
        Ok(resp) => resp,
        Err(err) => err.with_request_id(request_id).into_response(),
    }
}

async fn forward(state: AppState, req: Request, request_id: &str) -> AppResult<Response> {
    let (parts, body) = req.into_parts();

    let auth = state.auth.validate(&parts.headers).await;
    if !auth.valid {
        metrics::counter!("llmrelay_requests_rejected_total").increment(1);
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "missing or invalid API key",
        )
        .with_type("authentication_error"));
    }

    let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|err| {
            AppError::new(StatusCode::BAD_REQUEST, "request_body_unreadable", err.to_string())
        })?;
    let mut body = UpstreamBody::from_bytes(bytes);
    if let Some(UpstreamBody::Json(value)) = body.as_mut() {
        if state.routing.apply(value) {
            tracing::debug!("provider routing hint added");
        }
    }

    let json = body.as_ref().and_then(|b| b.as_json());
    let streaming = upstream::is_stream_request(body.as_ref());
    let inject = streaming && is_chat_completions(parts.uri.path());
    let model = json
        .and_then(|v| v.get("model"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let trace = state.trace_sink.clone().map(|sink| TraceContext {
        sink,
        input_messages: trace_sink::input_messages(json),
    });
    let max_context_tokens = match (inject, model.as_deref()) {
        (true, Some(model)) => state.model_limits.lookup(model).await,
        _ => None,
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let upstream_req = upstream::build_upstream_request(
        &state.config,
        state.retry.clone(),
        InboundRequest {
            method: &parts.method,
            path_and_query,
            headers: &parts.headers,
            body,
        },
        auth.forward_authorization.clone(),
        request_id,
    )?;
    tracing::debug!(
        url = %upstream_req.url,
        stream = streaming,
        model = ?model,
        "forwarding request"
    );
    metrics::counter!(
        "llmrelay_requests_total",
        "stream" => if streaming { "true" } else { "false" }
    )
    .increment(1);

    // The balance lookup runs alongside the upstream call.
    let banner = async {
        match (inject, state.banner.as_ref()) {
            (true, Some(source)) => source.banner(&auth).await,
            _ => None,
        }
    };
    let (banner, result) = tokio::join!(banner, upstream::dispatch(&state.http, &upstream_req));

    let upstream_resp = match result {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(
                status = ?err.status,
                code = ?err.code,
                "upstream call failed: {}",
                err.message
            );
            metrics::counter!("llmrelay_upstream_failures_total").increment(1);
            return Ok(relay::upstream_error_response(err, request_id, streaming));
        }
    };

    if !streaming {
        return Ok(relay::relay_buffered(upstream_resp, request_id, trace).await);
    }

    let policy = if inject {
        InjectionPolicy {
            banner,
            max_context_tokens,
            rewrite_ids: true,
        }
    } else {
        InjectionPolicy::passthrough()
    };
    let stream_state = StreamState::new(new_response_id(), trace.is_some());
    let injector = StreamInjector::new(policy, stream_state, model);
    Ok(relay::relay_stream(upstream_resp, injector, request_id, trace))
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(crate::REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn is_chat_completions(path: &str) -> bool {
    path.trim_end_matches('/').ends_with("/chat/completions")
}

fn new_response_id() -> String {
    format!("gen-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn chat_completion_paths_are_recognised() {
        assert!(is_chat_completions("/api/v1/chat/completions"));
        assert!(is_chat_completions("/v1/chat/completions/"));
        assert!(!is_chat_completions("/api/v1/completions"));
        assert!(!is_chat_completions("/api/v1/embeddings"));
    }

    #[test]
    fn request_id_header_is_read() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_request_id(&headers), None);
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        assert_eq!(extract_request_id(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn response_ids_are_unique() {
        let a = new_response_id();
        assert!(a.starts_with("gen-"));
        assert_ne!(a, new_response_id());
    }
}
