//! HTTP client for OpenAI-compatible chat completion endpoints
//!
//! Each model group carries its own endpoint, key and optional proxy; the
//! client keeps one reqwest client per proxy configuration so groups routed
//! through different egress paths never share a connection pool.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::{MODEL_CALLS, MODEL_CALL_DURATION};
use crate::model::messages::{ChatMessage, MessageSegment};

/// Connection settings for one model group.
#[derive(Debug, Clone)]
pub struct ModelGroupConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub proxy: Option<String>,
    pub supports_vision: bool,
    pub supports_reasoning: bool,
    /// Whether exhausting this group may divert to the fallback group
    pub allow_fallback: bool,
    pub timeout: Duration,
}

impl ModelGroupConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            api_key: String::new(),
            model: "qwen3:8b".to_string(),
            proxy: None,
            supports_vision: false,
            supports_reasoning: true,
            allow_fallback: true,
            timeout: Duration::from_secs(120),
        }
    }

    /// Read a group from `{prefix}_URL`, `{prefix}_KEY`, `{prefix}_NAME`,
    /// `{prefix}_PROXY`, `{prefix}_VISION`. Unset variables keep defaults.
    pub fn from_env(prefix: &str, name: &str) -> Self {
        let mut group = Self::named(name);
        if let Ok(v) = std::env::var(format!("{prefix}_URL")) {
            group.base_url = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_KEY")) {
            group.api_key = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_NAME")) {
            group.model = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_PROXY")) {
            group.proxy = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_VISION")) {
            group.supports_vision = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var(format!("{prefix}_NO_FALLBACK")) {
            group.allow_fallback = !(v == "1" || v.eq_ignore_ascii_case("true"));
        }
        group
    }
}

#[derive(Debug)]
pub enum ModelError {
    Request(reqwest::Error),
    Api { status: u16, message: String },
    Parse(String),
    EmptyResponse,
}

impl ModelError {
    /// Whether a retry against the same or a fallback group makes sense.
    pub fn retryable(&self) -> bool {
        match self {
            ModelError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ModelError::Api { status, .. } => *status == 429 || *status >= 500,
            ModelError::Parse(_) => false,
            ModelError::EmptyResponse => true,
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Request(e) => write!(f, "model request failed: {}", e),
            ModelError::Api { status, message } => {
                write!(f, "model API error {}: {}", status, message)
            }
            ModelError::Parse(e) => write!(f, "malformed model response: {}", e),
            ModelError::EmptyResponse => write!(f, "model returned no choices"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        ModelError::Request(e)
    }
}

/// One completed model call.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub reasoning: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn send(
        &self,
        group: &ModelGroupConfig,
        messages: &[ChatMessage],
    ) -> Result<ModelResponse, ModelError>;
}

// Wire types for the /chat/completions request and response.

/// One item from a streaming model response.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A token fragment of the reply
    Token(String),
    /// End of the stream
    Done,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn to_wire(msg: &ChatMessage, vision: bool) -> WireMessage {
    let all_text = !vision || !msg.has_images();
    if all_text {
        return WireMessage {
            role: msg.role.clone(),
            content: WireContent::Text(msg.text()),
        };
    }
    let parts = msg
        .segments
        .iter()
        .map(|s| match s {
            MessageSegment::Text { text } => WirePart::Text { text: text.clone() },
            MessageSegment::Image { mime, data } => WirePart::ImageUrl {
                image_url: WireImageUrl {
                    url: format!("data:{};base64,{}", mime, data),
                },
            },
        })
        .collect();
    WireMessage {
        role: msg.role.clone(),
        content: WireContent::Parts(parts),
    }
}

/// reqwest-backed [`ModelClient`].
pub struct HttpModelClient {
    // keyed by proxy URL ("" for direct) so each egress path gets its own pool
    clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpModelClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, group: &ModelGroupConfig) -> Result<reqwest::Client, ModelError> {
        let key = group.proxy.clone().unwrap_or_default();
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = clients.get(&key) {
            return Ok(existing.clone());
        }
        let mut builder = reqwest::Client::builder().timeout(group.timeout);
        if let Some(proxy_url) = &group.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpModelClient {
    /// Streaming variant of [`ModelClient::send`].
    ///
    /// Yields reply tokens as the endpoint produces them, ending with
    /// [`StreamDelta::Done`]. Usage metadata is not available in this mode.
    pub async fn send_streaming(
        &self,
        group: &ModelGroupConfig,
        messages: &[ChatMessage],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamDelta, ModelError>> + Send>>, ModelError>
    {
        let client = self.client_for(group)?;
        let wire: Vec<WireMessage> = messages
            .iter()
            .map(|m| to_wire(m, group.supports_vision))
            .collect();
        let body = WireRequest {
            model: &group.model,
            messages: wire,
            stream: true,
        };
        let url = format!("{}/chat/completions", group.base_url.trim_end_matches('/'));

        let mut request = client.post(&url).json(&body);
        if !group.api_key.is_empty() {
            request = request.bearer_auth(&group.api_key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        // SSE lines can split across network chunks; carry the partial tail
        let mut buf = String::new();
        let deltas = response.bytes_stream().flat_map(move |chunk| {
            let mut out: Vec<Result<StreamDelta, ModelError>> = Vec::new();
            match chunk {
                Ok(bytes) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        if let Some(delta) = parse_sse_line(line.trim()) {
                            out.push(delta);
                        }
                    }
                }
                Err(e) => out.push(Err(ModelError::Request(e))),
            }
            futures_util::stream::iter(out)
        });
        Ok(Box::pin(deltas))
    }
}

/// Parse one SSE line from a streaming completion response.
fn parse_sse_line(line: &str) -> Option<Result<StreamDelta, ModelError>> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(Ok(StreamDelta::Done));
    }
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(data) => {
            let token = data["choices"][0]["delta"]["content"].as_str()?;
            Some(Ok(StreamDelta::Token(token.to_string())))
        }
        Err(e) => Some(Err(ModelError::Parse(e.to_string()))),
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn send(
        &self,
        group: &ModelGroupConfig,
        messages: &[ChatMessage],
    ) -> Result<ModelResponse, ModelError> {
        let client = self.client_for(group)?;
        let wire: Vec<WireMessage> = messages
            .iter()
            .map(|m| to_wire(m, group.supports_vision))
            .collect();
        let body = WireRequest {
            model: &group.model,
            messages: wire,
            stream: false,
        };
        let url = format!("{}/chat/completions", group.base_url.trim_end_matches('/'));

        let started = Instant::now();
        let mut request = client.post(&url).json(&body);
        if !group.api_key.is_empty() {
            request = request.bearer_auth(&group.api_key);
        }
        let result = request.send().await;
        let latency = started.elapsed();
        MODEL_CALL_DURATION
            .with_label_values(&[group.name.as_str()])
            .observe(latency.as_secs_f64());

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                MODEL_CALLS
                    .with_label_values(&[group.name.as_str(), "transport_error"])
                    .inc();
                warn!(group = %group.name, error = %e, "model request failed");
                return Err(ModelError::Request(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            MODEL_CALLS
                .with_label_values(&[group.name.as_str(), "api_error"])
                .inc();
            warn!(group = %group.name, status = status.as_u16(), "model API error");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            MODEL_CALLS
                .with_label_values(&[group.name.as_str(), "empty"])
                .inc();
            ModelError::EmptyResponse
        })?;
        let usage = parsed.usage.unwrap_or_default();

        MODEL_CALLS
            .with_label_values(&[group.name.as_str(), "ok"])
            .inc();
        debug!(
            group = %group.name,
            latency_ms = latency.as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "model call complete"
        );

        Ok(ModelResponse {
            text: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: latency.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_retryable_only_for_throttle_and_server_faults() {
        let throttled = ModelError::Api {
            status: 429,
            message: String::new(),
        };
        let server = ModelError::Api {
            status: 503,
            message: String::new(),
        };
        let bad_request = ModelError::Api {
            status: 400,
            message: String::new(),
        };
        assert!(throttled.retryable());
        assert!(server.retryable());
        assert!(!bad_request.retryable());
        assert!(!ModelError::Parse("x".into()).retryable());
        assert!(ModelError::EmptyResponse.retryable());
    }

    #[test]
    fn text_only_message_serializes_as_plain_string() {
        let wire = to_wire(&ChatMessage::user("hello"), true);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn image_message_serializes_as_parts_for_vision_groups() {
        let msg = ChatMessage::user_parts(vec![
            MessageSegment::text("look"),
            MessageSegment::image("image/png", b"abc"),
        ]);
        let wire = to_wire(&msg, true);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        let url = json["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn non_vision_group_flattens_to_text() {
        let msg = ChatMessage::user_parts(vec![
            MessageSegment::text("look"),
            MessageSegment::image("image/png", b"abc"),
        ]);
        let wire = to_wire(&msg, false);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["content"], "look");
    }

    #[test]
    fn sse_lines_parse_into_deltas() {
        let token = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#);
        assert!(matches!(token, Some(Ok(StreamDelta::Token(t))) if t == "hi"));

        let done = parse_sse_line("data: [DONE]");
        assert!(matches!(done, Some(Ok(StreamDelta::Done))));

        // keep-alive comments and role-only deltas yield nothing
        assert!(parse_sse_line(": ping").is_none());
        assert!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());

        let bad = parse_sse_line("data: {not json");
        assert!(matches!(bad, Some(Err(ModelError::Parse(_)))));
    }

    #[test]
    fn group_from_env_defaults() {
        let group = ModelGroupConfig::named("default");
        assert_eq!(group.name, "default");
        assert!(group.proxy.is_none());
    }
}
