//! Splits an upstream byte stream into complete SSE events.
//!
//! Chunk boundaries are arbitrary: a single event may arrive in many chunks
//! and one chunk may carry many events. Splicing works on bytes, so a UTF-8
//! sequence cut in half by the transport is reassembled before decoding.

const EVENT_DELIMITER: &[u8] = b"\n\n";

pub const DONE_MARKER: &str = "[DONE]";

/// One event block, without its terminating blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    raw: String,
}

impl SseEvent {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn from_data(data: &str) -> Self {
        Self::new(format!("data: {data}"))
    }

    pub fn done() -> Self {
        Self::from_data(DONE_MARKER)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Joined `data:` lines, or `None` for comment-only blocks.
    pub fn data(&self) -> Option<String> {
        let mut out: Option<String> = None;
        for line in self.raw.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some(value) = line.strip_prefix("data:") else {
                continue;
            };
            let value = value.strip_prefix(' ').unwrap_or(value);
            match out.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(value);
                }
                None => out = Some(value.to_string()),
            }
        }
        out
    }

    /// Same block with its `data:` lines replaced by a single line carrying
    /// `data`. Other fields (`event:`, `id:`, comments) keep their place.
    pub fn with_data(&self, data: &str) -> Self {
        let mut lines: Vec<String> = Vec::new();
        let mut placed = false;
        for line in self.raw.split('\n') {
            if line.starts_with("data:") {
                if !placed {
                    lines.push(format!("data: {data}"));
                    placed = true;
                }
                continue;
            }
            lines.push(line.to_string());
        }
        if !placed {
            lines.push(format!("data: {data}"));
        }
        Self::new(lines.join("\n"))
    }

    pub fn is_done(&self) -> bool {
        self.data().is_some_and(|d| d.trim() == DONE_MARKER)
    }

    /// Wire form, including the blank-line terminator.
    pub fn to_frame(&self) -> String {
        format!("{}\n\n", self.raw)
    }
}

/// Appends `chunk` to `pending` and cuts every complete event out of it.
/// Returns the events in order and the unterminated remainder.
pub fn splice_chunk(pending: Vec<u8>, chunk: &[u8]) -> (Vec<SseEvent>, Vec<u8>) {
    let (events, pending, _) = splice_from(pending, chunk, 0);
    (events, pending)
}

/// `splice_chunk` that skips the first `scanned` bytes of `pending`, known
/// to hold no delimiter start. Also returns the offset to resume from.
fn splice_from(
    mut pending: Vec<u8>,
    chunk: &[u8],
    scanned: usize,
) -> (Vec<SseEvent>, Vec<u8>, usize) {
    pending.extend_from_slice(chunk);
    let mut events = Vec::new();
    let mut start = 0;
    let mut search_from = scanned.min(pending.len());
    while let Some(offset) = find_delimiter(&pending[search_from..]) {
        let end = search_from + offset;
        push_event(&mut events, &pending[start..end]);
        start = end + EVENT_DELIMITER.len();
        search_from = start;
    }
    if start > 0 {
        pending.drain(..start);
    }
    // A delimiter may begin in the last byte and finish in the next chunk.
    let resume = pending.len().saturating_sub(EVENT_DELIMITER.len() - 1);
    (events, pending, resume)
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(EVENT_DELIMITER.len())
        .position(|window| window == EVENT_DELIMITER)
}

fn push_event(events: &mut Vec<SseEvent>, piece: &[u8]) {
    let text = String::from_utf8_lossy(piece);
    if text.trim().is_empty() {
        return;
    }
    events.push(SseEvent::new(text.into_owned()));
}

/// Owned splice state for one upstream response.
#[derive(Debug, Default)]
pub struct SpliceBuffer {
    pending: Vec<u8>,
    scanned: usize,
}

impl SpliceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let (events, pending, scanned) =
            splice_from(std::mem::take(&mut self.pending), chunk, self.scanned);
        self.pending = pending;
        self.scanned = scanned;
        events
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_text(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    /// Drains the unterminated tail left when the upstream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let pending = std::mem::take(&mut self.pending);
        self.scanned = 0;
        let mut events = Vec::new();
        push_event(&mut events, &pending);
        events.pop()
    }
}
