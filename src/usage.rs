use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Reads an OpenAI-style `usage` object. `total_tokens` is derived when
    /// the upstream leaves it out.
    pub fn from_value(usage: &Value) -> Option<Self> {
        let usage = usage.as_object()?;
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64());
        let completion = usage.get("completion_tokens").and_then(|v| v.as_u64());
        if prompt.is_none() && completion.is_none() {
            return None;
        }
        let prompt_tokens = prompt.unwrap_or(0);
        let completion_tokens = completion.unwrap_or(0);
        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens));
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }

    fn merge_max(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = self.total_tokens.max(other.total_tokens);
    }
}

/// Per-chunk facts other than content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMeta {
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

impl ChunkMeta {
    pub fn from_chunk(value: &Value) -> Self {
        let finish_reason = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|choices| {
                choices
                    .iter()
                    .find_map(|c| c.get("finish_reason").and_then(|v| v.as_str()))
            })
            .map(|s| s.to_string());
        Self {
            finish_reason,
            usage: value.get("usage").and_then(TokenUsage::from_value),
            model: value
                .get("model")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.finish_reason.is_none() && self.usage.is_none()
    }
}

/// Snapshot handed to the warning decision and the trace sink once a
/// response is complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccumulatedResponse {
    pub id: String,
    pub model: Option<String>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Running totals for one stream. Token counts only ever grow.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    model: Option<String>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, meta: &ChunkMeta) {
        if let Some(reason) = meta.finish_reason.as_ref() {
            self.finish_reason = Some(reason.clone());
        }
        if let Some(model) = meta.model.as_ref() {
            self.model = Some(model.clone());
        }
        if let Some(delta) = meta.usage.as_ref() {
            match self.usage.as_mut() {
                Some(existing) => existing.merge_max(delta),
                None => self.usage = Some(*delta),
            }
        }
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    pub fn prompt_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.prompt_tokens)
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn snapshot(&self, id: &str, content: Option<String>) -> AccumulatedResponse {
        AccumulatedResponse {
            id: id.to_string(),
            model: self.model.clone(),
            content,
            finish_reason: self.finish_reason.clone(),
            usage: self.usage,
        }
    }
}

/// Builds the same snapshot from a buffered (non-streaming) chat completion.
pub fn summarize_completion(body: &Value) -> AccumulatedResponse {
    let meta = ChunkMeta::from_chunk(body);
    let content = body
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    AccumulatedResponse {
        id: body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        model: meta.model,
        content,
        finish_reason: meta.finish_reason,
        usage: meta.usage,
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkMeta, TokenUsage, UsageAccumulator, summarize_completion};
    use serde_json::json;

    #[test]
    fn usage_total_is_derived_when_missing() {
        let usage = TokenUsage::from_value(&json!({"prompt_tokens": 10, "completion_tokens": 4}))
            .unwrap();
        assert_eq!(usage.total_tokens, 14);
        assert!(TokenUsage::from_value(&json!({"cost": 0.1})).is_none());
        assert!(TokenUsage::from_value(&json!(null)).is_none());
    }

    #[test]
    fn accumulator_never_decreases_counts() {
        let mut acc = UsageAccumulator::new();
        acc.observe(&ChunkMeta::from_chunk(&json!({
            "model": "openai/gpt-5",
            "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
        })));
        acc.observe(&ChunkMeta::from_chunk(&json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 90, "completion_tokens": 30}
        })));
        let usage = acc.usage().unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 120);
        let snap = acc.snapshot("gen-1", None);
        assert_eq!(snap.finish_reason.as_deref(), Some("stop"));
        assert_eq!(snap.model.as_deref(), Some("openai/gpt-5"));
        assert_eq!(snap.content, None);
    }

    #[test]
    fn meta_without_usage_or_finish_is_empty() {
        let meta = ChunkMeta::from_chunk(&json!({
            "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]
        }));
        assert!(meta.is_empty());
    }

    #[test]
    fn buffered_completion_is_summarized() {
        let snap = summarize_completion(&json!({
            "id": "gen-9",
            "model": "anthropic/claude",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }));
        assert_eq!(snap.id, "gen-9");
        assert_eq!(snap.content.as_deref(), Some("hello"));
        assert_eq!(snap.finish_reason.as_deref(), Some("length"));
        assert_eq!(snap.usage.unwrap().total_tokens, 4);
    }
}
