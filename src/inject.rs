//! In-flight rewriting of chat completion streams: a stable response id,
//! a one-time banner on the first real content delta, and a context-window
//! warning written just before the terminal `[DONE]`.

use crate::sse::{SpliceBuffer, SseEvent};
use crate::usage::{AccumulatedResponse, ChunkMeta, UsageAccumulator};
use serde_json::{Value, json};

const CONTENT_POINTER: &str = "/choices/0/delta/content";

/// Result of the single tolerant parse each event goes through.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Done,
    ContentDelta { text: String, meta: ChunkMeta },
    UsageDelta { meta: ChunkMeta },
    Other,
}

pub fn parse_event(event: &SseEvent) -> (Option<Value>, ParsedEvent) {
    let Some(data) = event.data() else {
        return (None, ParsedEvent::Other);
    };
    if data.trim() == crate::sse::DONE_MARKER {
        return (None, ParsedEvent::Done);
    }
    match serde_json::from_str::<Value>(&data) {
        Ok(value) => {
            let parsed = classify(&value);
            (Some(value), parsed)
        }
        Err(err) => {
            tracing::debug!(error = %err, "unparseable stream event passed through");
            (None, ParsedEvent::Other)
        }
    }
}

pub fn classify(value: &Value) -> ParsedEvent {
    let meta = ChunkMeta::from_chunk(value);
    match value.pointer(CONTENT_POINTER).and_then(|v| v.as_str()) {
        Some(text) if !text.is_empty() => ParsedEvent::ContentDelta {
            text: text.to_string(),
            meta,
        },
        _ if !meta.is_empty() => ParsedEvent::UsageDelta { meta },
        _ => ParsedEvent::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextWarningLevel {
    None,
    Info,
    Warning,
    Critical,
}

impl ContextWarningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextWarningLevel::None => "none",
            ContextWarningLevel::Info => "info",
            ContextWarningLevel::Warning => "warning",
            ContextWarningLevel::Critical => "critical",
        }
    }
}

/// Inclusive lower bounds: 25 % info, 40 % warning, 50 % critical.
pub fn context_warning_level(prompt_tokens: u64, max_context_tokens: u64) -> ContextWarningLevel {
    if max_context_tokens == 0 {
        return ContextWarningLevel::None;
    }
    let used = prompt_tokens as u128 * 100;
    let max = max_context_tokens as u128;
    if used >= max * 50 {
        ContextWarningLevel::Critical
    } else if used >= max * 40 {
        ContextWarningLevel::Warning
    } else if used >= max * 25 {
        ContextWarningLevel::Info
    } else {
        ContextWarningLevel::None
    }
}

pub fn context_warning(
    prompt_tokens: u64,
    max_context_tokens: u64,
) -> Option<(ContextWarningLevel, String)> {
    let level = context_warning_level(prompt_tokens, max_context_tokens);
    let percent = prompt_tokens as u128 * 100 / max_context_tokens.max(1) as u128;
    let counts = format!(
        "{}/{} tokens",
        format_tokens(prompt_tokens),
        format_tokens(max_context_tokens)
    );
    let text = match level {
        ContextWarningLevel::None => return None,
        ContextWarningLevel::Info => {
            format!("Context usage: {percent}% of this model's window ({counts}).")
        }
        ContextWarningLevel::Warning => format!(
            "Context window {percent}% full ({counts}). Consider starting a new conversation soon."
        ),
        ContextWarningLevel::Critical => format!(
            "Context window {percent}% full ({counts}). Start a new conversation to avoid truncated context and rising costs."
        ),
    };
    Some((level, text))
}

fn format_tokens(tokens: u64) -> String {
    if tokens >= 1000 {
        format!("{}k", (tokens + 500) / 1000)
    } else {
        tokens.to_string()
    }
}

/// Per-request injection inputs, fixed before the upstream call starts.
#[derive(Debug, Clone, Default)]
pub struct InjectionPolicy {
    pub banner: Option<String>,
    pub max_context_tokens: Option<u64>,
    pub rewrite_ids: bool,
}

impl InjectionPolicy {
    /// No rewriting at all; usage is still tracked.
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn warning_for(&self, prompt_tokens: u64) -> Option<(ContextWarningLevel, String)> {
        context_warning(prompt_tokens, self.max_context_tokens?)
    }
}

/// Everything one streamed response carries between chunks.
#[derive(Debug)]
pub struct StreamState {
    pub byte_buffer: SpliceBuffer,
    pub first_content_injected: bool,
    pub rewritten_id: String,
    pub usage: UsageAccumulator,
    /// Only present when a trace sink is attached to the request.
    pub tracing_buffer: Option<String>,
    warning_emitted: bool,
    done_relayed: bool,
}

impl StreamState {
    pub fn new(rewritten_id: String, capture_content: bool) -> Self {
        Self {
            byte_buffer: SpliceBuffer::new(),
            first_content_injected: false,
            rewritten_id,
            usage: UsageAccumulator::new(),
            tracing_buffer: capture_content.then(String::new),
            warning_emitted: false,
            done_relayed: false,
        }
    }
}

pub struct StreamInjector {
    state: StreamState,
    policy: InjectionPolicy,
    model: Option<String>,
}

impl StreamInjector {
    pub fn new(policy: InjectionPolicy, state: StreamState, model: Option<String>) -> Self {
        Self {
            state,
            policy,
            model,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Splices `chunk` and returns the wire frames ready for the client.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        let events = self.state.byte_buffer.push(chunk);
        let mut frames = Vec::with_capacity(events.len());
        for event in events {
            frames.extend(self.process_event(event));
        }
        frames
    }

    pub fn process_event(&mut self, event: SseEvent) -> Vec<String> {
        let (value, parsed) = parse_event(&event);
        match (value, parsed) {
            (_, ParsedEvent::Done) => {
                let mut frames = self.warning_frames();
                frames.push(event.to_frame());
                self.state.done_relayed = true;
                frames
            }
            (Some(mut value), ParsedEvent::ContentDelta { text, meta }) => {
                self.state.usage.observe(&meta);
                if let Some(buf) = self.state.tracing_buffer.as_mut() {
                    buf.push_str(&text);
                }
                let mut changed = self.rewrite_id(&mut value);
                if !self.state.first_content_injected && !text.trim().is_empty() {
                    if let Some(banner) = self.policy.banner.as_deref() {
                        if prepend_content(&mut value, banner) {
                            self.state.first_content_injected = true;
                            changed = true;
                            metrics::counter!("llmrelay_banner_injections_total").increment(1);
                        }
                    }
                }
                vec![reframe(&event, &value, changed)]
            }
            (Some(mut value), ParsedEvent::UsageDelta { meta }) => {
                self.state.usage.observe(&meta);
                let changed = self.rewrite_id(&mut value);
                vec![reframe(&event, &value, changed)]
            }
            (Some(mut value), _) => {
                let changed = self.rewrite_id(&mut value);
                vec![reframe(&event, &value, changed)]
            }
            (None, _) => vec![event.to_frame()],
        }
    }

    /// Flushes an unterminated tail and, if the upstream never sent
    /// `[DONE]`, the pending context warning.
    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if let Some(tail) = self.state.byte_buffer.finish() {
            frames.extend(self.process_event(tail));
        }
        if !self.state.done_relayed {
            frames.extend(self.warning_frames());
        }
        frames
    }

    /// True once the upstream `[DONE]` has been written out.
    pub fn done_relayed(&self) -> bool {
        self.state.done_relayed
    }

    /// Raw text of a partially received event, if any.
    pub fn pending_text(&self) -> String {
        self.state.byte_buffer.pending_text()
    }

    pub fn into_accumulated(self) -> AccumulatedResponse {
        let StreamState {
            rewritten_id,
            usage,
            tracing_buffer,
            ..
        } = self.state;
        let mut snapshot = usage.snapshot(&rewritten_id, tracing_buffer);
        if snapshot.model.is_none() {
            snapshot.model = self.model;
        }
        snapshot
    }

    fn rewrite_id(&self, value: &mut Value) -> bool {
        if !self.policy.rewrite_ids {
            return false;
        }
        let Some(obj) = value.as_object_mut() else {
            return false;
        };
        match obj.get("id") {
            Some(Value::String(id)) if *id != self.state.rewritten_id => {
                obj.insert(
                    "id".to_string(),
                    Value::String(self.state.rewritten_id.clone()),
                );
                true
            }
            _ => false,
        }
    }

    fn warning_frames(&mut self) -> Vec<String> {
        if self.state.warning_emitted {
            return Vec::new();
        }
        self.state.warning_emitted = true;
        let Some(prompt_tokens) = self.state.usage.prompt_tokens() else {
            return Vec::new();
        };
        let Some((level, text)) = self.policy.warning_for(prompt_tokens) else {
            return Vec::new();
        };
        tracing::info!(
            level = level.as_str(),
            prompt_tokens,
            max_context_tokens = self.policy.max_context_tokens,
            "injecting context window warning"
        );
        metrics::counter!("llmrelay_context_warnings_total", "level" => level.as_str())
            .increment(1);
        let model = self
            .state
            .usage
            .model()
            .map(|m| m.to_string())
            .or_else(|| self.model.clone());
        vec![warning_event(&self.state.rewritten_id, model.as_deref(), &text).to_frame()]
    }
}

fn prepend_content(value: &mut Value, prefix: &str) -> bool {
    let Some(content) = value.pointer_mut(CONTENT_POINTER) else {
        return false;
    };
    let Some(text) = content.as_str() else {
        return false;
    };
    *content = Value::String(format!("{prefix}{text}"));
    true
}

fn reframe(event: &SseEvent, value: &Value, changed: bool) -> String {
    if changed {
        event.with_data(&value.to_string()).to_frame()
    } else {
        event.to_frame()
    }
}

pub fn warning_event(id: &str, model: Option<&str>, text: &str) -> SseEvent {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model.unwrap_or_default(),
        "choices": [{
            "index": 0,
            "delta": { "content": format!("\n\n{text}") },
            "finish_reason": Value::Null,
        }]
    });
    SseEvent::from_data(&chunk.to_string())
}
