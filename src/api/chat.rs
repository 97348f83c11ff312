//! Chat endpoint: stores the user's message and streams the assistant's reply
//! back as server-sent events.

use crate::api::chat::schemas::ChatRequest;
use crate::api::{ApiError, ExtractUser};
use crate::core::inference::CompletionRequest;
use crate::core::relay::{RelayOutcome, StreamRelay};
use crate::core::session::{SessionRegistry, StreamSession};
use crate::core::traits::{ConversationService, InferenceClient, SettingsService};
use crate::event::RelayEvent;
use axum::extract::Path;
use axum::http::HeaderName;
use axum::http::header::CACHE_CONTROL;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Sse};
use axum::routing::post;
use axum::{Json, Router};
use di_axum::Inject;
use futures_util::StreamExt;
use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const EVENT_BUFFER: usize = 64;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn router() -> Router {
    Router::new().route("/:id", post(chat))
}

async fn chat(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(settings_service): Inject<dyn SettingsService>,
    Inject(inference): Inject<dyn InferenceClient>,
    Inject(sessions): Inject<SessionRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<i64>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let image = request.image.filter(|image| !image.trim().is_empty());
    if request.content.trim().is_empty() && image.is_none() {
        return Err(ApiError::Unprocessable("message must not be empty".into()));
    }

    if conversation_service
        .get_conversation(current_user, conversation_id)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound("conversation"));
    }

    let lease = sessions.begin(conversation_id).await?;

    conversation_service
        .create_user_message(conversation_id, request.content.clone(), image.clone())
        .await?;

    let history = conversation_service
        .get_history(current_user, conversation_id)
        .await?;
    let params = settings_service.get_generation_params(current_user).await?;

    let session = StreamSession::new(current_user, request.content, lease);
    let completion = CompletionRequest {
        history,
        params,
        image,
    };

    let (sender, receiver) = mpsc::channel::<RelayEvent>(EVENT_BUFFER);
    let relay = StreamRelay::new(conversation_service, inference);

    tokio::spawn(async move {
        match relay.run(session, completion, sender).await {
            RelayOutcome::Cancelled { fragments } => {
                debug!("conversation {conversation_id}: relay cancelled after {fragments} fragments")
            }
            outcome => debug!("conversation {conversation_id}: {outcome:?}"),
        }
    });

    let events = ReceiverStream::new(receiver).map(|event| Event::default().json_data(event));

    Ok((
        [
            (CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

pub mod schemas {
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct ChatRequest {
        #[serde(default)]
        pub content: String,
        /// Base64 data URL.
        pub image: Option<String>,
    }
}
