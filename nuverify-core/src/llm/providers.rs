// LLM provider implementations: Anthropic and OpenAI-compatible endpoints.

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LlmSection;
use crate::error::{LlmError, VerifierError};

use super::{LlmProvider, SseLines, TokenUsage, supports_temperature};

fn llm_err(e: LlmError) -> VerifierError {
    VerifierError::Llm(e)
}

async fn send_checked(request: RequestBuilder) -> crate::error::Result<Response> {
    let resp = request
        .send()
        .await
        .map_err(|e| llm_err(LlmError::Network(e.to_string())))?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(llm_err(LlmError::ApiError { status, body: text }));
    }
    Ok(resp)
}

/// Read an SSE body, handing each `data:` payload to `on_data`.
async fn drain_sse(
    mut resp: Response,
    mut on_data: impl FnMut(&str) -> crate::error::Result<()>,
) -> crate::error::Result<()> {
    let mut sse = SseLines::default();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| llm_err(LlmError::Network(e.to_string())))?
    {
        for data in sse.push(&chunk) {
            on_data(&data)?;
        }
    }
    Ok(())
}

// ── Anthropic Provider ──────────────────────────────────────────────

#[derive(Debug)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: crate::http_client(),
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
            temperature: 0.1,
            max_tokens: 8192,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn request(&self, prompt: &str, stream: bool) -> RequestBuilder {
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: supports_temperature(&self.model).then_some(self.temperature),
            stream,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Apply one Anthropic stream event. Returns the text delta, if any.
fn anthropic_event(data: &str, usage: &mut TokenUsage) -> crate::error::Result<Option<String>> {
    let event: Value =
        serde_json::from_str(data).map_err(|e| llm_err(LlmError::Parse(e.to_string())))?;
    match event["type"].as_str() {
        Some("message_start") => {
            usage.input_tokens = event["message"]["usage"]["input_tokens"]
                .as_u64()
                .unwrap_or(0);
            Ok(None)
        }
        Some("content_block_delta") => Ok(event["delta"]["text"].as_str().map(str::to_string)),
        Some("message_delta") => {
            if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                usage.output_tokens = out;
            }
            Ok(None)
        }
        Some("error") => Err(llm_err(LlmError::ApiError {
            status: 0,
            body: event["error"].to_string(),
        })),
        _ => Ok(None),
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str) -> crate::error::Result<(String, TokenUsage)> {
        debug!(model = %self.model, "Calling Anthropic API");
        let resp = send_checked(self.request(prompt, false)).await?;

        let result: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| llm_err(LlmError::Parse(e.to_string())))?;

        let text = result
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<String>();

        Ok((
            text,
            TokenUsage {
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
            },
        ))
    }

    async fn call_streaming(
        &self,
        prompt: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> crate::error::Result<(String, TokenUsage)> {
        debug!(model = %self.model, "Streaming from Anthropic API");
        let resp = send_checked(self.request(prompt, true)).await?;

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        drain_sse(resp, |data| {
            if let Some(delta) = anthropic_event(data, &mut usage)? {
                text.push_str(&delta);
                let _ = chunks.send(delta);
            }
            Ok(())
        })
        .await?;
        Ok((text, usage))
    }
}

// ── OpenAI Provider ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: crate::http_client(),
            api_key,
            model,
            base_url: "https://api.openai.com".to_string(),
            temperature: 0.1,
            max_tokens: 8192,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    #[must_use]
    pub fn with_sampling(mut self, temperature: f64, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn request(&self, prompt: &str, stream: bool) -> RequestBuilder {
        let body = OpenAiRequest {
            model: self.model.clone(),
            max_completion_tokens: self.max_tokens,
            temperature: supports_temperature(&self.model).then_some(self.temperature),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };
        let base = self.base_url.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        };
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Apply one OpenAI stream chunk. Returns the text delta, if any.
fn openai_chunk(data: &str, usage: &mut TokenUsage) -> crate::error::Result<Option<String>> {
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: Value =
        serde_json::from_str(data).map_err(|e| llm_err(LlmError::Parse(e.to_string())))?;
    if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
        usage.input_tokens = u["prompt_tokens"].as_u64().unwrap_or(0);
        usage.output_tokens = u["completion_tokens"].as_u64().unwrap_or(0);
    }
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(&self, prompt: &str) -> crate::error::Result<(String, TokenUsage)> {
        debug!(model = %self.model, "Calling OpenAI API");
        let resp = send_checked(self.request(prompt, false)).await?;

        let result: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| llm_err(LlmError::Parse(e.to_string())))?;

        let text = result
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = result.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok((text, usage))
    }

    async fn call_streaming(
        &self,
        prompt: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> crate::error::Result<(String, TokenUsage)> {
        debug!(model = %self.model, "Streaming from OpenAI API");
        let resp = send_checked(self.request(prompt, true)).await?;

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        drain_sse(resp, |data| {
            if let Some(delta) = openai_chunk(data, &mut usage)? {
                text.push_str(&delta);
                let _ = chunks.send(delta);
            }
            Ok(())
        })
        .await?;
        Ok((text, usage))
    }
}

// ── Provider Factory ────────────────────────────────────────────────

/// Create an LLM provider from the `[llm]` config section.
pub fn create_provider(config: &LlmSection) -> crate::error::Result<Box<dyn LlmProvider>> {
    let api_key = config.resolve_api_key().ok_or_else(|| {
        llm_err(LlmError::Config(format!(
            "no API key: set llm.api_key or the {} environment variable",
            config.api_key_env
        )))
    })?;
    let model = config.model.clone();

    match config.provider.as_str() {
        "anthropic" => {
            let mut p = AnthropicProvider::new(api_key, model)
                .with_sampling(config.temperature, config.max_tokens);
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url.clone());
            }
            Ok(Box::new(p))
        }
        "openai" | "custom" => {
            if config.provider == "custom" && config.base_url.is_none() {
                return Err(llm_err(LlmError::Config(
                    "provider \"custom\" requires llm.base_url".into(),
                )));
            }
            let mut p = OpenAiProvider::new(api_key, model)
                .with_sampling(config.temperature, config.max_tokens);
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url.clone());
            }
            Ok(Box::new(p))
        }
        other => Err(llm_err(LlmError::Config(format!(
            "Unknown provider: {other}. Use: anthropic, openai, custom"
        )))),
    }
}

// ── Tests ───────────────────────────────────────────────────────────
