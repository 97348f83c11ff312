//! Drives one chat stream over HTTP into a view.

use crate::client::consumer::{Effect, EventDecoder, ViewState};
use crate::client::render::{FrameThrottle, RenderedView, render};
use crate::event::RelayEvent;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach the chat server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat server answered {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

/// Receives every render of a stream, in order.
pub trait ViewSink: Send + 'static {
    fn render(&mut self, view: RenderedView);
}

#[derive(Serialize, Debug, Clone)]
struct OutgoingMessage {
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Deserialize)]
struct CreatedConversation {
    id: i64,
}

/// HTTP access to the chat server on behalf of one user key.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    user_id: Uuid,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            user_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    pub async fn create_conversation(&self, title: Option<&str>) -> Result<i64, ClientError> {
        let response = self
            .http
            .post(self.url("conversations"))
            .header("X-User-ID", self.user_id.to_string())
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?;

        let created: CreatedConversation = check(response).await?.json().await?;
        Ok(created.id)
    }

    async fn open_chat(
        &self,
        conversation_id: i64,
        message: &OutgoingMessage,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("chat/{conversation_id}")))
            .header("X-User-ID", self.user_id.to_string())
            .json(message)
            .send()
            .await?;

        check(response).await
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.detail)
        .unwrap_or(text);

    Err(ClientError::Rejected {
        status: status.as_u16(),
        detail,
    })
}

/// One running stream. Dropping the handle does not stop it; [`Self::abort`] does.
pub struct StreamHandle {
    conversation_id: i64,
    token: CancellationToken,
    task: JoinHandle<ViewState>,
}

impl StreamHandle {
    fn spawn<S: ViewSink>(client: ChatClient, conversation_id: i64, message: OutgoingMessage, sink: S) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(drive(client, conversation_id, message, sink, token.clone()));

        Self {
            conversation_id,
            token,
            task,
        }
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Closes the connection at the next read boundary. The stream then ends
    /// as aborted, which is not an error.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the stream to end and returns the final state.
    pub async fn finished(self) -> ViewState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                let mut state = ViewState::default();
                state.start();
                state.apply(RelayEvent::error(e.to_string()));
                state
            }
        }
    }
}

/// One chat view: at most one stream at a time. Starting a stream aborts
/// the previous one.
pub struct ChatView<S> {
    client: ChatClient,
    sink: S,
    active: Option<StreamHandle>,
}

impl<S: ViewSink + Clone> ChatView<S> {
    pub fn new(client: ChatClient, sink: S) -> Self {
        Self {
            client,
            sink,
            active: None,
        }
    }

    pub fn send(&mut self, conversation_id: i64, content: impl Into<String>, image: Option<String>) -> &StreamHandle {
        if let Some(previous) = self.active.take() {
            debug!("superseding stream for conversation {}", previous.conversation_id());
            previous.abort();
        }

        let message = OutgoingMessage {
            content: content.into(),
            image,
        };
        let handle = StreamHandle::spawn(self.client.clone(), conversation_id, message, self.sink.clone());

        self.active.insert(handle)
    }

    pub fn abort(&self) {
        if let Some(active) = &self.active {
            active.abort();
        }
    }

    /// Whether input should be enabled.
    pub fn is_idle(&self) -> bool {
        self.active.as_ref().is_none_or(StreamHandle::is_finished)
    }

    /// Hands the active stream out, e.g. to wait for it.
    pub fn take(&mut self) -> Option<StreamHandle> {
        self.active.take()
    }
}

async fn drive<S: ViewSink>(
    client: ChatClient,
    conversation_id: i64,
    message: OutgoingMessage,
    mut sink: S,
    cancel: CancellationToken,
) -> ViewState {
    let mut state = ViewState::default();
    state.start();
    sink.render(render(&state));

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = client.open_chat(conversation_id, &message) => Some(opened),
    };

    let response = match opened {
        None => {
            state.abort();
            sink.render(render(&state));
            return state;
        }
        Some(Err(e)) => {
            warn!("chat request for conversation {conversation_id} failed: {e}");
            state.apply(RelayEvent::error(e.to_string()));
            sink.render(render(&state));
            return state;
        }
        Some(Ok(response)) => response,
    };

    let mut body = response.bytes_stream();
    let mut decoder = EventDecoder::new();
    let mut throttle = FrameThrottle::default();

    while !state.status.is_finished() {
        let deadline = throttle.deadline();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                state.abort();
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                throttle.rendered(Instant::now());
                sink.render(render(&state));
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let mut scheduled = false;
                    for event in decoder.push(&bytes) {
                        scheduled |= state.apply(event) == Effect::ScheduleRender;
                    }
                    if scheduled && !state.status.is_finished() && throttle.request(Instant::now()) {
                        sink.render(render(&state));
                    }
                }
                Some(Err(e)) => {
                    debug!("chat stream for conversation {conversation_id} broke: {e}");
                    state.connection_closed();
                }
                None => {
                    if let Some(event) = decoder.finish() {
                        state.apply(event);
                    }
                    state.connection_closed();
                }
            },
        }
    }

    // closes the connection when the stream ends early
    drop(body);

    sink.render(render(&state));
    state
}
