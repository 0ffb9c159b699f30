//! Server-sent-event decoding for streamed chat completions.

use super::client::{sanitize_api_response, OpenRouterApiError};
use patchwright_adapters::util::debug_stderr_enabled;
use patchwright_core::{ModelReply, Usage};
use serde::Deserialize;
use std::time::Duration;

/// Appended to the reply text when the stream goes quiet for longer than the stall timeout.
pub const STALL_MARKER: &str = "\n[Error: No response received for too long]";
pub const STALL_STOP_REASON: &str = "stall";

/// Splits raw response bytes into SSE event payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: Vec<u8>,
    event_data: String,
}

impl SseBuffer {
    /// Feed a chunk and return every event completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is left once the body ends without a trailing blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(event) = self.take_line(&line) {
                return Some(event);
            }
        }
        if self.event_data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.event_data))
        }
    }

    fn take_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end();
        if line.is_empty() {
            if self.event_data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.event_data));
        }
        // Comments (": OPENROUTER PROCESSING") and other fields are keep-alives.
        if let Some(data) = line.strip_prefix("data:") {
            if !self.event_data.is_empty() {
                self.event_data.push('\n');
            }
            self.event_data.push_str(data.trim_start());
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<OpenRouterApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one event did to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// New reply text.
    Delta(String),
    /// `[DONE]`: nothing more will arrive.
    Done,
    /// Usage-only chunks, role headers and unparseable payloads.
    Ignored,
}

/// Accumulated reply for one streamed call.
#[derive(Debug, Default)]
pub struct StreamState {
    pub text: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

impl StreamState {
    pub fn apply_event(&mut self, data: &str) -> anyhow::Result<StreamEvent> {
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(StreamEvent::Done);
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                if debug_stderr_enabled() {
                    eprintln!("  Warning: Skipping malformed stream chunk: {}", e);
                }
                return Ok(StreamEvent::Ignored);
            }
        };

        if let Some(err) = chunk.error {
            return Err(anyhow::anyhow!(
                "OpenRouter stream error: {}",
                sanitize_api_response(&err.message)
            ));
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let mut delta = String::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                delta.push_str(&content);
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(reason);
            }
        }
        if delta.is_empty() {
            return Ok(StreamEvent::Ignored);
        }
        self.text.push_str(&delta);
        Ok(StreamEvent::Delta(delta))
    }

    /// The stream went silent; keep what arrived and mark the cut.
    pub fn mark_stalled(&mut self) {
        self.text.push_str(STALL_MARKER);
        self.stop_reason = Some(STALL_STOP_REASON.to_string());
    }

    /// Finish the call. Providers that don't report cost are billed at the per-million rates.
    pub fn into_reply(self, duration: Duration, input_cost: f64, output_cost: f64) -> ModelReply {
        let mut usage = self.usage.unwrap_or_default();
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        if usage.cost.is_none() {
            usage.cost = Some(
                usage.prompt_tokens as f64 * input_cost / 1_000_000.0
                    + usage.completion_tokens as f64 * output_cost / 1_000_000.0,
            );
        }
        ModelReply {
            text: self.text,
            usage,
            duration,
            stop_reason: self.stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_buffer_joins_split_lines() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"data: {\"a\":").is_empty());
        assert!(sse.push(b"1}\r\n").is_empty());
        let events = sse.push(b"\r\ndata: [DONE]\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_sse_buffer_skips_comments_and_keeps_utf8() {
        let mut sse = SseBuffer::default();
        let text = "data: \"caf\u{e9}\"\n\n";
        let bytes = text.as_bytes();
        // Split inside the two-byte é.
        let split = text.find('\u{e9}').unwrap() + 1;
        assert!(sse.push(b": OPENROUTER PROCESSING\n\n").is_empty());
        assert!(sse.push(&bytes[..split]).is_empty());
        assert_eq!(sse.push(&bytes[split..]), vec!["\"caf\u{e9}\"".to_string()]);
    }

    #[test]
    fn test_sse_buffer_finish_flushes_unterminated_event() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"data: {\"x\":2}").is_empty());
        assert_eq!(sse.finish().as_deref(), Some("{\"x\":2}"));
        assert_eq!(sse.finish(), None);
    }

    #[test]
    fn test_stream_state_accumulates_deltas_and_usage() {
        let mut state = StreamState::default();
        let first = state
            .apply_event(r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(first, StreamEvent::Delta("Hel".to_string()));
        state
            .apply_event(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#)
            .unwrap();
        let usage = state
            .apply_event(
                r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"total_tokens":14,"cost":0.002}}"#,
            )
            .unwrap();
        assert_eq!(usage, StreamEvent::Ignored);
        assert_eq!(state.apply_event("[DONE]").unwrap(), StreamEvent::Done);

        let reply = state.into_reply(Duration::from_secs(2), 1.0, 1.0);
        assert_eq!(reply.text, "Hello");
        assert_eq!(reply.stop_reason.as_deref(), Some("stop"));
        assert_eq!(reply.usage.total_tokens, 14);
        assert_eq!(reply.usage.cost, Some(0.002));
    }

    #[test]
    fn test_stream_state_error_chunk_fails() {
        let mut state = StreamState::default();
        let err = state
            .apply_event(r#"{"error":{"message":"Upstream overloaded","code":502}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("Upstream overloaded"));
    }

    #[test]
    fn test_stream_state_ignores_garbage() {
        let mut state = StreamState::default();
        assert_eq!(state.apply_event("not json").unwrap(), StreamEvent::Ignored);
        assert!(state.text.is_empty());
    }

    #[test]
    fn test_stall_marker_and_rate_cost() {
        let mut state = StreamState::default();
        state.text.push_str("partial");
        state.usage = Some(Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 500_000,
            total_tokens: 0,
            cost: None,
        });
        state.mark_stalled();
        let reply = state.into_reply(Duration::from_secs(120), 2.0, 8.0);
        assert_eq!(
            reply.text,
            "partial\n[Error: No response received for too long]"
        );
        assert_eq!(reply.stop_reason.as_deref(), Some("stall"));
        assert_eq!(reply.usage.total_tokens, 1_500_000);
        assert!((reply.usage.cost() - 6.0).abs() < 1e-9);
    }
}
