//! Server-sent-event decoding for OpenAI-style completion streams.
//!
//! Bytes arrive in arbitrary slices; a line (and a UTF-8 character inside
//! it) may straddle two reads. The decoder keeps the unfinished tail in a
//! carry-over buffer and only interprets complete lines.

use parlance_core::provider::Usage;
use serde::Deserialize;
use tracing::trace;

/// Payload that ends the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// What a single complete line means.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// Blank, comment, non-`data:` or malformed line.
    Ignored,
    /// `data: [DONE]`
    Sentinel,
    /// A parsed frame.
    Frame {
        content: Option<String>,
        usage: Option<Usage>,
    },
}

/// Incremental decoder. Feed it raw body bytes with [`SseDecoder::push`].
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    latest_usage: Option<Usage>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a slice of the body. Returns the non-empty content deltas of
    /// every line completed by this slice, in wire order.
    ///
    /// Once the sentinel is seen nothing further is decoded.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        if self.finished {
            return deltas;
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            match parse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Ignored => {}
                SseLine::Sentinel => {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
                SseLine::Frame { content, usage } => {
                    if let Some(content) = content.filter(|c| !c.is_empty()) {
                        deltas.push(content);
                    }
                    if usage.is_some() {
                        self.latest_usage = usage;
                    }
                }
            }
        }

        deltas
    }

    /// Whether the `[DONE]` sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The most recent usage object seen in any frame.
    pub fn latest_usage(&self) -> Option<Usage> {
        self.latest_usage
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Interpret one complete line (without its terminator).
pub fn parse_line(line: &str) -> SseLine {
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignored;
    }

    let Some(payload) = line.strip_prefix("data: ") else {
        return SseLine::Ignored;
    };

    if payload.trim() == DONE_SENTINEL {
        return SseLine::Sentinel;
    }

    match serde_json::from_str::<StreamResponse>(payload) {
        Ok(frame) => {
            let choice = frame.choices.into_iter().next();
            if let Some(reason) = choice.as_ref().and_then(|c| c.finish_reason.as_deref()) {
                trace!(finish_reason = reason, "Choice finished");
            }
            SseLine::Frame {
                content: choice.and_then(|c| c.delta.content),
                usage: frame.usage,
            }
        }
        Err(e) => {
            trace!(data = %payload, error = %e, "Ignoring unparseable SSE frame");
            SseLine::Ignored
        }
    }
}

// --- Wire types (internal) ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default, alias = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUR_FRAMES: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n",
        "data: [DONE]\n",
    );

    #[test]
    fn decodes_four_frame_example() {
        let mut decoder = SseDecoder::new();
        let deltas = decoder.push(FOUR_FRAMES.as_bytes());
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(decoder.latest_usage(), Some(Usage::new(5, 2, 7)));
        assert!(decoder.is_finished());
    }

    #[test]
    fn camel_case_usage_on_empty_delta_frame() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{}}],\"usage\":{\"promptTokens\":5,\"completionTokens\":2,\"totalTokens\":7}}\n",
            "data: [DONE]\n",
        );

        let mut decoder = SseDecoder::new();
        let deltas = decoder.push(body.as_bytes());
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(decoder.latest_usage(), Some(Usage::new(5, 2, 7)));
        assert!(decoder.is_finished());
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n").is_empty());
    }

    #[test]
    fn byte_at_a_time_matches_single_read() {
        let mut decoder = SseDecoder::new();
        let mut deltas = Vec::new();
        for byte in FOUR_FRAMES.as_bytes() {
            deltas.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(decoder.latest_usage(), Some(Usage::new(5, 2, 7)));
        assert!(decoder.is_finished());
    }

    #[test]
    fn utf8_character_split_across_reads() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9} \u{2713}\"}}]}\n";
        let bytes = line.as_bytes();
        // Split inside the two-byte 'é'.
        let split = line.find('\u{e9}').unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert!(decoder.pending() > 0);
        let deltas = decoder.push(&bytes[split..]);
        assert_eq!(deltas, vec!["café ✓"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn crlf_comments_and_blank_lines() {
        let body = concat!(
            ": OPENROUTER PROCESSING\r\n",
            "\r\n",
            "event: message\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\r\n",
            "\r\n",
        );
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(body.as_bytes()), vec!["ok"]);
        assert!(!decoder.is_finished());
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let body = concat!(
            "data: {not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after\"}}]}\n",
        );
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(body.as_bytes()), vec!["after"]);
    }

    #[test]
    fn empty_and_null_content_emit_nothing() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":null},\"finish_reason\":\"stop\"}]}\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
        );
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(body.as_bytes()).is_empty());
    }

    #[test]
    fn latest_usage_wins() {
        let body = concat!(
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n",
            "data: {\"choices\":[],\"usage\":{\"promptTokens\":3,\"completionTokens\":4,\"totalTokens\":7}}\n",
            "data: {\"choices\":[],\"usage\":null}\n",
        );
        let mut decoder = SseDecoder::new();
        decoder.push(body.as_bytes());
        assert_eq!(decoder.latest_usage(), Some(Usage::new(3, 4, 7)));
    }

    #[test]
    fn nothing_decoded_after_sentinel() {
        let body = concat!(
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(body.as_bytes()).is_empty());
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n").is_empty());
        assert!(decoder.is_finished());
    }

    #[test]
    fn partial_line_is_held_back() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["a"]);
    }

    #[test]
    fn line_classification() {
        assert_eq!(parse_line(""), SseLine::Ignored);
        assert_eq!(parse_line(": keep-alive"), SseLine::Ignored);
        assert_eq!(parse_line("id: 42"), SseLine::Ignored);
        assert_eq!(parse_line("data: [DONE]"), SseLine::Sentinel);
        assert!(matches!(parse_line("data: {}"), SseLine::Frame { content: None, usage: None }));
    }
}
