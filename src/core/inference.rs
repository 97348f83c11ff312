//! Client for an OpenAI compatible inference server (llama.cpp `llama-server`).

use crate::config::AppConfig;
use crate::core::traits::InferenceClient;
use crate::infrastructure::entities;
use crate::infrastructure::entities::Role;
use crate::lines::LineBuffer;
use async_stream::try_stream;
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use futures_util::{Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout, timeout_at};

/// Longest upstream error body passed on to users.
const ERROR_BODY_LIMIT: usize = 512;

/// Raw text fragments, in the order the upstream produced them.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Cannot connect to LLM server at {url}. Is llama.cpp running?")]
    Unreachable { url: String },

    #[error("LLM server error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("LLM server sent nothing for {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("LLM stream failed: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<entities::Message> for ChatMessage {
    fn from(m: entities::Message) -> Self {
        Self {
            role: m.role,
            content: m.content,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    /// Empty means whatever the server has loaded.
    pub model: String,
    /// Base url of the inference server, without the `/v1` suffix.
    pub target_server: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub history: Vec<ChatMessage>,
    pub params: GenerationParams,
    /// Data URL attached to the newest user message.
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f64,
    top_k: i64,
    top_p: f64,
    repeat_penalty: f64,
    max_tokens: i64,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: WireContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl<'a> },
}

#[derive(Debug, Serialize)]
struct ImageUrl<'a> {
    url: &'a str,
}

impl CompletionRequest {
    fn body(&self) -> CompletionBody<'_> {
        let params = &self.params;
        let mut messages = Vec::with_capacity(self.history.len() + 1);

        if !params.system_prompt.is_empty() {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: WireContent::Text(&params.system_prompt),
            });
        }

        let image_target = self
            .image
            .as_ref()
            .and_then(|_| self.history.iter().rposition(|m| m.role == Role::User));

        for (index, message) in self.history.iter().enumerate() {
            let content = match (&self.image, image_target) {
                (Some(image), Some(target)) if target == index => WireContent::Parts(vec![
                    ContentPart::Text {
                        text: &message.content,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image },
                    },
                ]),
                _ => WireContent::Text(&message.content),
            };
            messages.push(WireMessage {
                role: message.role.as_str(),
                content,
            });
        }

        CompletionBody {
            model: Some(params.model.as_str()).filter(|model| !model.is_empty()),
            messages,
            stream: true,
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            repeat_penalty: params.repeat_penalty,
            max_tokens: params.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    #[serde(default = "default_owner")]
    pub owned_by: String,
}

fn default_object() -> String {
    "model".to_owned()
}

fn default_owner() -> String {
    "llama.cpp".to_owned()
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum UpstreamLine {
    Fragment(String),
    Done,
    Skip,
}

/// Interprets one line of the upstream body. Both SSE framing (`data: {..}`)
/// and bare JSON lines are accepted; anything unparseable is skipped.
fn parse_line(line: &str) -> Result<UpstreamLine, InferenceError> {
    let line = line.trim();
    let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);

    if payload.is_empty() || payload.starts_with(':') {
        return Ok(UpstreamLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(UpstreamLine::Done);
    }

    let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) else {
        debug!("skipping unparseable upstream line: {payload}");
        return Ok(UpstreamLine::Skip);
    };

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return Err(InferenceError::Protocol(message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(UpstreamLine::Fragment)
        .unwrap_or(UpstreamLine::Skip))
}

pub struct LlamaInferenceClient {
    http: reqwest::Client,
    idle_timeout: Duration,
}

#[injectable(InferenceClient)]
impl LlamaInferenceClient {
    #[inject]
    pub fn create(config: Ref<AppConfig>) -> LlamaInferenceClient {
        LlamaInferenceClient::new(config.upstream_idle_timeout)
    }
}

impl LlamaInferenceClient {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            idle_timeout,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, InferenceError> {
        let response = timeout(self.idle_timeout, request.send())
            .await
            .map_err(|_| InferenceError::Timeout(self.idle_timeout))?
            .map_err(|e| classify_send_error(e, url, self.idle_timeout))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = error_body(response, self.idle_timeout).await;
            return Err(InferenceError::Status { status, body });
        }

        Ok(response)
    }
}

/// Reads at most `ERROR_BODY_LIMIT` bytes of an error response, giving up
/// after `idle`.
async fn error_body(mut response: reqwest::Response, idle: Duration) -> String {
    let deadline = Instant::now() + idle;
    let mut body = Vec::new();

    while body.len() <= ERROR_BODY_LIMIT {
        match timeout_at(deadline, response.chunk()).await {
            Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }

    let truncated = body.len() > ERROR_BODY_LIMIT;
    body.truncate(ERROR_BODY_LIMIT);
    let mut text = String::from_utf8_lossy(&body).trim().to_owned();
    if truncated {
        text.push_str("...");
    }
    text
}

fn classify_send_error(error: reqwest::Error, url: &str, idle_timeout: Duration) -> InferenceError {
    if error.is_timeout() {
        InferenceError::Timeout(idle_timeout)
    } else {
        debug!("request to {url} failed: {error}");
        InferenceError::Unreachable {
            url: url.to_owned(),
        }
    }
}

fn endpoint(target_server: &str, path: &str) -> String {
    format!("{}/v1/{path}", target_server.trim_end_matches('/'))
}

/// Turns a streaming response body into fragments. The upstream times out
/// once `idle` passes without a fragment, however much else it sends;
/// dropping the stream drops the response and with it the connection.
fn fragments(response: reqwest::Response, idle: Duration) -> impl Stream<Item = Result<String, InferenceError>> + Send {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut finished = false;
        let mut last_fragment = Instant::now();

        'read: loop {
            let next = timeout_at(last_fragment + idle, body.next())
                .await
                .map_err(|_| InferenceError::Timeout(idle))?;
            let Some(chunk) = next else {
                break 'read;
            };
            let chunk = chunk.map_err(|e| InferenceError::Protocol(e.to_string()))?;

            for line in lines.push(&chunk) {
                match parse_line(&line)? {
                    UpstreamLine::Fragment(text) => {
                        yield text;
                        last_fragment = Instant::now();
                    }
                    UpstreamLine::Done => {
                        finished = true;
                        break 'read;
                    }
                    UpstreamLine::Skip => {}
                }
            }
        }

        if !finished {
            if let Some(line) = lines.finish() {
                if let UpstreamLine::Fragment(text) = parse_line(&line)? {
                    yield text;
                }
            }
        }
    }
}

#[async_trait]
impl InferenceClient for LlamaInferenceClient {
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<FragmentStream, InferenceError> {
        let url = endpoint(&request.params.target_server, "chat/completions");
        debug!("opening completion stream at {url}");

        let response = self
            .send(self.http.post(&url).json(&request.body()), &url)
            .await?;

        Ok(Box::pin(fragments(response, self.idle_timeout)))
    }

    async fn list_models(&self, target_server: &str) -> Result<Vec<ModelInfo>, InferenceError> {
        let url = endpoint(target_server, "models");
        let response = self.send(self.http.get(&url), &url).await?;

        let list: ModelList = timeout(self.idle_timeout, response.json())
            .await
            .map_err(|_| InferenceError::Timeout(self.idle_timeout))?
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;

        Ok(list.data)
    }
}
