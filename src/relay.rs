//! Turns an upstream outcome into the client response: buffered bodies,
//! spliced and injected event streams, and the error shapes for both.

use crate::error::AppError;
use crate::inject::StreamInjector;
use crate::sse::SseEvent;
use crate::trace_sink::{self, TraceSink};
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use crate::usage::summarize_completion;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Where a finished response is reported, if anywhere.
#[derive(Clone)]
pub struct TraceContext {
    pub sink: Arc<dyn TraceSink>,
    pub input_messages: Value,
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(crate::REQUEST_ID_HEADER, value);
    }
}

/// Non-streaming relay: upstream status, filtered headers, complete body.
pub async fn relay_buffered(
    upstream: reqwest::Response,
    request_id: &str,
    trace: Option<TraceContext>,
) -> Response {
    let status = upstream.status();
    let mut headers = filter_response_headers(upstream.headers());
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!("failed to read upstream body: {err}");
            return AppError::new(StatusCode::BAD_GATEWAY, "upstream_body_failed", err.to_string())
                .with_type("upstream_error")
                .with_request_id(request_id)
                .into_response();
        }
    };
    if let Some(trace) = trace {
        if let Ok(value) = serde_json::from_slice::<Value>(&body) {
            trace_sink::spawn_trace(
                trace.sink,
                trace.input_messages,
                summarize_completion(&value),
                request_id.to_string(),
            );
        }
    }
    set_request_id(&mut headers, request_id);
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

fn sse_response(body: Body, request_id: &str) -> Response {
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    set_request_id(headers, request_id);
    resp
}

/// Streaming relay. Frames are produced by a task that owns the injector and
/// handed to the response body through a bounded channel.
pub fn relay_stream(
    upstream: reqwest::Response,
    injector: StreamInjector,
    request_id: &str,
    trace: Option<TraceContext>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(STREAM_CHANNEL_CAPACITY);
    let span = tracing::Span::current();
    tokio::spawn(
        pump(
            Box::pin(upstream.bytes_stream()),
            injector,
            tx,
            request_id.to_string(),
            trace,
        )
        .instrument(span),
    );
    sse_response(Body::from_stream(ReceiverStream::new(rx)), request_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    ClientGone,
}

/// Moves upstream chunks through `injector` into `tx` until the upstream
/// ends, fails, or the client goes away.
pub async fn pump<S, E>(
    mut upstream: S,
    mut injector: StreamInjector,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    request_id: String,
    trace: Option<TraceContext>,
) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Display,
{
    let outcome = 'relay: loop {
        let next = tokio::select! {
            _ = tx.closed() => break 'relay StreamOutcome::ClientGone,
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for frame in injector.push_chunk(&chunk) {
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        break 'relay StreamOutcome::ClientGone;
                    }
                }
            }
            Some(Err(err)) => break 'relay StreamOutcome::Failed(err.to_string()),
            None => break 'relay StreamOutcome::Completed,
        }
    };
    drop(upstream);

    let outcome = match outcome {
        StreamOutcome::Completed => {
            let mut finished = StreamOutcome::Completed;
            for frame in injector.finish() {
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    finished = StreamOutcome::ClientGone;
                    break;
                }
            }
            finished
        }
        StreamOutcome::Failed(message) if injector.done_relayed() => {
            tracing::debug!("upstream failed after [DONE]: {message}");
            StreamOutcome::Completed
        }
        StreamOutcome::Failed(message) => {
            tracing::warn!("upstream stream failed: {message}");
            metrics::counter!("llmrelay_stream_errors_total").increment(1);
            let error = synthetic_error_event(&injector.pending_text(), &message);
            for event in [error, SseEvent::done()] {
                if tx.send(Ok(Bytes::from(event.to_frame()))).await.is_err() {
                    break;
                }
            }
            StreamOutcome::Failed(message)
        }
        StreamOutcome::ClientGone => StreamOutcome::ClientGone,
    };
    if outcome == StreamOutcome::ClientGone {
        tracing::info!("client disconnected; upstream stream cancelled");
        metrics::counter!("llmrelay_stream_client_disconnects_total").increment(1);
    }
    drop(tx);

    if let Some(trace) = trace {
        trace_sink::spawn_trace(
            trace.sink,
            trace.input_messages,
            injector.into_accumulated(),
            request_id,
        );
    }
    outcome
}

/// Error event for a failed stream. A payload that already carries an
/// `error` object is reused, otherwise `message` is wrapped.
pub fn synthetic_error_event(partial: &str, message: &str) -> SseEvent {
    let candidate = partial.trim();
    let candidate = SseEvent::new(candidate)
        .data()
        .filter(|data| !data.trim().is_empty())
        .unwrap_or_else(|| candidate.to_string());
    let reused = serde_json::from_str::<Value>(&candidate)
        .ok()
        .and_then(|value| value.get("error").cloned())
        .filter(|error| error.is_object());
    let error = reused.unwrap_or_else(|| json!({ "message": message }));
    SseEvent::from_data(&json!({ "error": error }).to_string())
}

/// A streaming call whose upstream answered non-2xx: one error event and
/// `[DONE]`, sent as a normal event stream.
pub fn sse_error_response(err: &UpstreamCallError, request_id: &str) -> Response {
    let mut event = synthetic_error_event(err.body.as_deref().unwrap_or_default(), &err.message);
    if let Some(status) = err.status {
        if let Some(data) = event.data() {
            if let Ok(mut value) = serde_json::from_str::<Value>(&data) {
                if let Some(error) = value.get_mut("error").and_then(|v| v.as_object_mut()) {
                    error
                        .entry("code")
                        .or_insert_with(|| json!(status.as_u16()));
                }
                event = SseEvent::from_data(&value.to_string());
            }
        }
    }
    let body = format!("{}{}", event.to_frame(), SseEvent::done().to_frame());
    sse_response(Body::from(body), request_id)
}

/// Client response for a call that failed before any byte was relayed.
/// Streaming calls reach here only after retryable statuses were retried.
pub fn upstream_error_response(
    err: UpstreamCallError,
    request_id: &str,
    streaming: bool,
) -> Response {
    match (&err.kind, err.status) {
        (UpstreamErrorKind::Http, Some(_)) if streaming => sse_error_response(&err, request_id),
        (UpstreamErrorKind::Http, Some(status)) => {
            let mut headers = filter_response_headers(&err.headers);
            set_request_id(&mut headers, request_id);
            let mut resp = Response::new(Body::from(err.body.unwrap_or_default()));
            *resp.status_mut() = status;
            *resp.headers_mut() = headers;
            resp
        }
        (UpstreamErrorKind::Request, _) => {
            AppError::new(StatusCode::BAD_REQUEST, "upstream_request_invalid", err.message)
                .with_request_id(request_id)
                .into_response()
        }
        _ if err.is_timeout() => {
            AppError::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", err.message)
                .with_type("upstream_error")
                .with_request_id(request_id)
                .into_response()
        }
        _ => AppError::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", err.message)
            .with_type("upstream_error")
            .with_request_id(request_id)
            .into_response(),
    }
}
