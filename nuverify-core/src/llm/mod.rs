pub mod providers;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Token usage from an LLM call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Common interface for LLM providers.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// The model ID being used.
    fn model_id(&self) -> &str;

    /// Call the LLM with a prompt and return response + token usage.
    async fn call(&self, prompt: &str) -> crate::error::Result<(String, TokenUsage)>;

    /// Like [`call`](Self::call), forwarding each text delta to `chunks` as it arrives.
    ///
    /// The returned string is the full concatenated response. A dropped
    /// receiver does not abort the call.
    async fn call_streaming(
        &self,
        prompt: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> crate::error::Result<(String, TokenUsage)>;
}

/// Reasoning-model families reject an explicit temperature.
pub fn supports_temperature(model: &str) -> bool {
    let model = model.rsplit('/').next().unwrap_or(model);
    !["gpt-5", "o1", "o3", "o4"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

/// Incremental splitter for server-sent event streams.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters and
/// lines split across network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    /// Feed bytes and return the `data:` payloads of every completed line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Strip a surrounding Markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Locate the outermost JSON array in free-form model output.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let text = strip_code_fence(text);
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_support_by_family() {
        assert!(supports_temperature("gpt-4"));
        assert!(supports_temperature("claude-sonnet-4-20250514"));
        assert!(!supports_temperature("gpt-5-mini"));
        assert!(!supports_temperature("o3"));
        assert!(!supports_temperature("openai/o4-mini"));
    }

    #[test]
    fn sse_lines_across_chunks() {
        let mut sse = SseLines::default();
        assert!(sse.push(b"data: {\"a\"").is_empty());
        let out = sse.push(b":1}\n\nevent: ping\ndata: [DONE]\r\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_lines_keep_split_utf8() {
        let mut sse = SseLines::default();
        let bytes = "data: héllo\n".as_bytes();
        let (a, b) = bytes.split_at(8);
        assert!(sse.push(a).is_empty());
        assert_eq!(sse.push(b), vec!["héllo".to_string()]);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  [1]  "), "[1]");
        assert_eq!(
            extract_json_array("Here you go:\n```\n[{\"x\": 1}]\n```"),
            Some("[{\"x\": 1}]")
        );
        assert_eq!(extract_json_array("COMPATIBLE"), None);
    }
}
