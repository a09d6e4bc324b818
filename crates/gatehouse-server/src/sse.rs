//! SSE frame grammar and the thinking/content demultiplexer
//!
//! Every event on the wire is `data: <TAG>:<payload>`, TAG in
//! `SESSION|CONTENT|THINK|SOURCE|ERROR|DONE`. The demultiplexer is a two
//! state machine over the token stream: answer text until a think marker
//! opens, reasoning text until one closes. Chunks arrive at arbitrary byte
//! boundaries, so a tail reserve keeps partially-received markers in the
//! buffer between feeds.

use axum::response::sse::Event;

/// One typed frame of the response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Session(String),
    Content(String),
    Think(String),
    Source(serde_json::Value),
    Error(String),
    Done,
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Session(_) => "SESSION",
            Frame::Content(_) => "CONTENT",
            Frame::Think(_) => "THINK",
            Frame::Source(_) => "SOURCE",
            Frame::Error(_) => "ERROR",
            Frame::Done => "DONE",
        }
    }

    /// Wire form without SSE framing, `TAG:payload`.
    pub fn to_wire(&self) -> String {
        match self {
            Frame::Session(s) => format!("SESSION:{s}"),
            Frame::Content(s) => format!("CONTENT:{s}"),
            Frame::Think(s) => format!("THINK:{s}"),
            Frame::Source(v) => format!("SOURCE:{v}"),
            Frame::Error(s) => format!("ERROR:{s}"),
            Frame::Done => "DONE:".to_string(),
        }
    }

    pub fn to_event(&self) -> Event {
        Event::default().data(self.to_wire())
    }
}

/// Markers opening a reasoning span inside plain content.
const THINK_START: [&str; 4] = ["<think>", "【咨询解析】", "## 思考过程", "关键实体"];
/// Markers closing a reasoning span.
const THINK_END: [&str; 3] = ["</think>", "【综合解答】", "## 最终答案"];

/// Longest marker byte length; the buffer tail that may still grow into a
/// marker is never flushed early.
const TAIL_RESERVE: usize = 16;

/// Flush threshold for the rolling buffer, in characters.
const FLUSH_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Content,
    InThink,
}

/// Output half of the demultiplexer: which channel a flushed span belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Content(String),
    Think(String),
}

/// Splits a streamed answer into content and reasoning spans.
///
/// When the model exposes a dedicated reasoning channel the caller routes
/// those chunks directly and only feeds answer content here; the marker scan
/// then never fires, which is correct.
pub struct ThinkDemux {
    state: DemuxState,
    buffer: String,
}

impl ThinkDemux {
    pub fn new() -> Self {
        Self {
            state: DemuxState::Content,
            buffer: String::new(),
        }
    }

    /// Feed one chunk, returning any spans that became complete.
    pub fn feed(&mut self, chunk: &str) -> Vec<Span> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let markers: &[&str] = match self.state {
                DemuxState::Content => &THINK_START,
                DemuxState::InThink => &THINK_END,
            };

            let earliest = markers
                .iter()
                .filter_map(|m| self.buffer.find(m).map(|pos| (pos, *m)))
                .min_by_key(|(pos, _)| *pos);

            match earliest {
                Some((pos, marker)) => {
                    let before: String = self.buffer[..pos].to_string();
                    self.buffer.drain(..pos + marker.len());
                    if !before.is_empty() {
                        out.push(self.span(before));
                    }
                    self.state = match self.state {
                        DemuxState::Content => DemuxState::InThink,
                        DemuxState::InThink => DemuxState::Content,
                    };
                }
                None => {
                    // No full marker; flush all but a tail that might still
                    // be the front half of one.
                    if self.buffer.chars().count() > FLUSH_CHARS {
                        let keep_from = self
                            .buffer
                            .char_indices()
                            .rev()
                            .take(TAIL_RESERVE)
                            .last()
                            .map(|(i, _)| i)
                            .unwrap_or(0);
                        if keep_from > 0 {
                            let flushed: String = self.buffer[..keep_from].to_string();
                            self.buffer.drain(..keep_from);
                            out.push(self.span(flushed));
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Flush whatever remains at stream end.
    pub fn finish(&mut self) -> Vec<Span> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buffer);
        vec![self.span(rest)]
    }

    fn span(&self, text: String) -> Span {
        match self.state {
            DemuxState::Content => Span::Content(text),
            DemuxState::InThink => Span::Think(text),
        }
    }
}

impl Default for ThinkDemux {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip fenced code-block markers from user-facing content so the UI never
/// renders spurious code blocks.
pub fn clean_content(text: &str) -> String {
    text.replace("```", "")
}
