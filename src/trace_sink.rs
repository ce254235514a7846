//! Fire-and-forget hand-off of finished responses to an observability
//! collaborator. Nothing here is part of a request's completion: records are
//! dispatched on a detached task after the client response has ended.

use crate::usage::AccumulatedResponse;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("trace sink rejected record: {0}")]
    Rejected(String),
    #[error("trace sink transport failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn record(
        &self,
        input_messages: Value,
        response: AccumulatedResponse,
        correlation_id: String,
    ) -> Result<(), SinkError>;
}

/// Emits each record as a structured log line.
pub struct LogTraceSink;

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn record(
        &self,
        input_messages: Value,
        response: AccumulatedResponse,
        correlation_id: String,
    ) -> Result<(), SinkError> {
        let usage = response.usage.unwrap_or_default();
        tracing::info!(
            target: "llmrelay::trace",
            request_id = %correlation_id,
            response_id = %response.id,
            model = ?response.model,
            finish_reason = ?response.finish_reason,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            input_messages = input_messages.as_array().map(|a| a.len()).unwrap_or(0),
            content_chars = response.content.as_ref().map(|c| c.chars().count()).unwrap_or(0),
            "generation traced"
        );
        Ok(())
    }
}

/// Posts each record as JSON to a webhook.
pub struct HttpTraceSink {
    http: reqwest::Client,
    url: String,
}

impl HttpTraceSink {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    async fn record(
        &self,
        input_messages: Value,
        response: AccumulatedResponse,
        correlation_id: String,
    ) -> Result<(), SinkError> {
        let payload = json!({
            "correlation_id": correlation_id,
            "input": input_messages,
            "output": response,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let resp = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SinkError::Rejected(format!("status {}", resp.status())));
        }
        Ok(())
    }
}

/// Dispatches one record on its own task. Errors and panics inside the sink
/// are logged and dropped.
pub fn spawn_trace(
    sink: Arc<dyn TraceSink>,
    input_messages: Value,
    response: AccumulatedResponse,
    correlation_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let id = correlation_id.clone();
        let outcome = AssertUnwindSafe(sink.record(input_messages, response, correlation_id))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(request_id = %id, "trace dispatch failed: {err}");
            }
            Err(_) => {
                tracing::warn!(request_id = %id, "trace sink panicked");
            }
        }
    })
}

/// `messages` from a chat request body, or an empty list.
pub fn input_messages(body: Option<&Value>) -> Value {
    body.and_then(|b| b.get("messages"))
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingSink;

    #[async_trait]
    impl TraceSink for PanickingSink {
        async fn record(&self, _: Value, _: AccumulatedResponse, _: String) -> Result<(), SinkError> {
            panic!("sink exploded");
        }
    }

    fn response() -> AccumulatedResponse {
        AccumulatedResponse {
            id: "gen-1".to_string(),
            model: None,
            content: Some("hi".to_string()),
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    #[tokio::test]
    async fn panicking_sink_is_contained() {
        let handle = spawn_trace(Arc::new(PanickingSink), json!([]), response(), "r".to_string());
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_webhook_is_an_error_not_a_panic() {
        let sink = HttpTraceSink::new(reqwest::Client::new(), "http://127.0.0.1:1/ingest".to_string());
        let err = sink
            .record(json!([]), response(), "r".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Transport(_)));
        assert!(LogTraceSink.record(json!([]), response(), "r".to_string()).await.is_ok());
    }

    #[test]
    fn input_messages_defaults_to_empty_list() {
        assert_eq!(input_messages(None), json!([]));
        let body = json!({"messages": [{"role": "user", "content": "q"}]});
        assert_eq!(input_messages(Some(&body))[0]["content"], "q");
    }
}
