//! Reassembly of chat-completion server-sent-event streams.
//!
//! The body is consumed chunk by chunk; only complete lines are interpreted. Tool-call
//! fragments are appended per index in arrival order and their `arguments` are left as
//! raw strings until the stream ends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const DATA_PREFIX: &str = "data:";
const DONE: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub function: FunctionCall,
}

/// Everything recovered from a drained stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStream {
    pub content: String,
    /// Calls with a non-empty name: indexed delta calls in index order, then whole calls.
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    raw: Vec<u8>,
    partial: Vec<u8>,
    content: String,
    indexed: BTreeMap<u64, ToolCall>,
    whole: Vec<ToolCall>,
    skipped: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next body chunk. Chunk boundaries may fall anywhere, including inside a
    /// multi-byte character.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
        self.partial.extend_from_slice(chunk);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.push_line(&String::from_utf8_lossy(&line));
        }
    }

    /// The unmodified bytes seen so far.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Lines that looked like data but did not parse.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Interpret one line. Anything other than a `data:` line is ignored.
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.trim() == DONE {
            return;
        }
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(v) => self.apply(&v),
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream line");
                self.skipped += 1;
            }
        }
    }

    fn apply(&mut self, v: &serde_json::Value) {
        let Some(choice) = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
        else {
            return;
        };
        let delta = choice.get("delta");
        let message = choice.get("message");

        for part in [delta, message].into_iter().flatten() {
            if let Some(s) = part.get("content").and_then(|c| c.as_str()) {
                self.content.push_str(s);
            }
        }

        if let Some(calls) = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|c| c.as_array())
        {
            for c in calls {
                if let Ok(call) = serde_json::from_value::<ToolCall>(c.clone()) {
                    self.whole.push(call);
                }
            }
        }

        if let Some(fragments) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|c| c.as_array())
        {
            for f in fragments {
                self.apply_fragment(f);
            }
        }
    }

    fn apply_fragment(&mut self, f: &serde_json::Value) {
        let index = f.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let slot = self.indexed.entry(index).or_default();
        if let Some(id) = f.get("id").and_then(|s| s.as_str()).filter(|s| !s.is_empty()) {
            slot.id = id.to_string();
        }
        if let Some(func) = f.get("function") {
            if let Some(name) = func.get("name").and_then(|s| s.as_str()) {
                slot.function.name.push_str(name);
            }
            if let Some(args) = func.get("arguments").and_then(|s| s.as_str()) {
                slot.function.arguments.push_str(args);
            }
        }
    }

    /// Flush any unterminated last line and return what was reconstructed.
    pub fn finish(mut self) -> (ParsedStream, Vec<u8>) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push_line(&String::from_utf8_lossy(&line));
        }
        let tool_calls = self
            .indexed
            .into_values()
            .chain(self.whole)
            .filter(|c| !c.function.name.is_empty())
            .collect();
        (
            ParsedStream {
                content: self.content,
                tool_calls,
            },
            self.raw,
        )
    }
}

/// Parse a complete buffered body.
pub fn parse_sse(body: &[u8]) -> ParsedStream {
    let mut acc = StreamAccumulator::new();
    acc.feed(body);
    acc.finish().0
}
