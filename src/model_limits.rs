use crate::config::ModelLimitEntry;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Read-mostly table of context window sizes keyed by model id. Request
/// handling only reads it; a refresh task replaces it wholesale.
#[derive(Clone)]
pub struct ModelLimits {
    inner: Arc<RwLock<HashMap<String, u64>>>,
    default_context_tokens: Option<u64>,
}

impl ModelLimits {
    pub fn new(default_context_tokens: Option<u64>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            default_context_tokens,
        }
    }

    pub fn from_entries(entries: &[ModelLimitEntry], default_context_tokens: Option<u64>) -> Self {
        let table = entries
            .iter()
            .map(|e| (e.model.clone(), e.max_context_tokens))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(table)),
            default_context_tokens,
        }
    }

    /// Exact id first, then the id without a `:variant` suffix, then the
    /// configured default.
    pub async fn lookup(&self, model: &str) -> Option<u64> {
        let guard = self.inner.read().await;
        if let Some(limit) = guard.get(model) {
            return Some(*limit);
        }
        if let Some((base, _)) = model.split_once(':') {
            if let Some(limit) = guard.get(base) {
                return Some(*limit);
            }
        }
        self.default_context_tokens
    }

    /// Merges fetched limits over the current table; statically configured
    /// models not present in `fetched` are kept.
    pub async fn merge(&self, fetched: HashMap<String, u64>) {
        let mut guard = self.inner.write().await;
        guard.extend(fetched);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
pub trait LimitsSource: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, u64>, String>;
}

/// Reads `data[].id` / `data[].context_length` from an OpenRouter-style
/// models listing.
pub struct ModelsEndpointSource {
    http: reqwest::Client,
    url: String,
}

impl ModelsEndpointSource {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl LimitsSource for ModelsEndpointSource {
    async fn fetch(&self) -> Result<HashMap<String, u64>, String> {
        let resp = self
            .http
            .get(&self.url)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("models listing returned {status}"));
        }
        let body: Value = resp.json().await.map_err(|err| err.to_string())?;
        Ok(parse_models_listing(&body))
    }
}

pub fn parse_models_listing(body: &Value) -> HashMap<String, u64> {
    body.get("data")
        .and_then(|v| v.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| {
                    let id = m.get("id")?.as_str()?;
                    let limit = m
                        .get("context_length")
                        .and_then(|v| v.as_u64())
                        .or_else(|| {
                            m.get("top_provider")
                                .and_then(|p| p.get("context_length"))
                                .and_then(|v| v.as_u64())
                        })?;
                    Some((id.to_string(), limit))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Refreshes `table` from `source` every `interval`, starting immediately.
pub fn spawn_refresh(
    table: ModelLimits,
    source: Arc<dyn LimitsSource>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.fetch().await {
                Ok(fetched) => {
                    let count = fetched.len();
                    table.merge(fetched).await;
                    tracing::debug!(models = count, "model limits refreshed");
                }
                Err(err) => tracing::warn!("failed to refresh model limits: {err}"),
            }
            tokio::time::sleep(interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn lookup_falls_back_to_base_id_then_default() {
        let table = ModelLimits::from_entries(
            &[ModelLimitEntry {
                model: "anthropic/claude-sonnet-4".to_string(),
                max_context_tokens: 200_000,
            }],
            Some(128_000),
        );
        assert_eq!(table.lookup("anthropic/claude-sonnet-4").await, Some(200_000));
        assert_eq!(
            table.lookup("anthropic/claude-sonnet-4:thinking").await,
            Some(200_000)
        );
        assert_eq!(table.lookup("unknown/model").await, Some(128_000));
        assert_eq!(ModelLimits::new(None).lookup("x").await, None);
    }

    #[tokio::test]
    async fn merge_keeps_static_entries() {
        let table = ModelLimits::from_entries(
            &[ModelLimitEntry {
                model: "static/model".to_string(),
                max_context_tokens: 1_000,
            }],
            None,
        );
        table
            .merge(HashMap::from([("openai/gpt-5".to_string(), 400_000)]))
            .await;
        assert_eq!(table.len().await, 2);
        assert_eq!(table.lookup("openai/gpt-5").await, Some(400_000));
    }

    #[test]
    fn models_listing_is_parsed() {
        let parsed = parse_models_listing(&json!({
            "data": [
                {"id": "openai/gpt-5", "context_length": 400000},
                {"id": "x/y", "top_provider": {"context_length": 8192}},
                {"id": "no/limit"},
                {"context_length": 5}
            ]
        }));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["openai/gpt-5"], 400_000);
        assert_eq!(parsed["x/y"], 8_192);
        assert!(parse_models_listing(&json!({})).is_empty());
    }

    struct FixedSource;

    #[async_trait]
    impl LimitsSource for FixedSource {
        async fn fetch(&self) -> Result<HashMap<String, u64>, String> {
            Ok(HashMap::from([("a/b".to_string(), 42)]))
        }
    }

    #[tokio::test]
    async fn refresh_task_populates_table() {
        let table = ModelLimits::new(None);
        let handle = spawn_refresh(table.clone(), Arc::new(FixedSource), Duration::from_secs(60));
        for _ in 0..50 {
            if table.lookup("a/b").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(table.lookup("a/b").await, Some(42));
    }
}
