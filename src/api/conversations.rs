//! Conversations endpoints

use crate::api::conversations::schemas::{
    ConversationDetail, ConversationList, CreateConversation, MessagesList, UpdateConversation,
};
use crate::api::{ApiError, ExtractUser};
use crate::core::session::SessionRegistry;
use crate::core::traits::ConversationService;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use di_axum::Inject;
use log::info;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conversations).post(new_conversation))
        .route(
            "/:id",
            get(conversation_detail)
                .put(update_conversation)
                .delete(delete_conversation),
        )
        .route("/:id/messages", get(conversation_messages))
}

async fn list_conversations(
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<ConversationList>, ApiError> {
    let conversations = conversation_service.list_conversations(current_user).await?;

    Ok(Json(ConversationList {
        conversations: conversations
            .into_iter()
            .map(schemas::Conversation::from)
            .collect(),
    }))
}

async fn new_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(current_user): ExtractUser,
    body: Option<Json<CreateConversation>>,
) -> Result<(StatusCode, Json<schemas::Conversation>), ApiError> {
    let title = body.and_then(|Json(body)| body.title);
    let conversation = conversation_service
        .create_conversation(current_user, title)
        .await?;

    Ok((StatusCode::CREATED, Json(conversation.into())))
}

async fn conversation_detail(
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let conversation = conversation_service
        .get_conversation(current_user, conversation_id)
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;

    let messages = conversation_service
        .list_messages(current_user, conversation_id)
        .await?;

    Ok(Json(ConversationDetail {
        conversation: conversation.into(),
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn update_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<i64>,
    Json(update): Json<UpdateConversation>,
) -> Result<Json<schemas::Conversation>, ApiError> {
    if update.title.trim().is_empty() {
        return Err(ApiError::Unprocessable("title must not be empty".into()));
    }

    let conversation = conversation_service
        .rename_conversation(current_user, conversation_id, update.title)
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;

    Ok(Json(conversation.into()))
}

async fn delete_conversation(
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(sessions): Inject<SessionRegistry>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !conversation_service
        .delete_conversation(current_user, conversation_id)
        .await?
    {
        return Err(ApiError::NotFound("conversation"));
    }

    if sessions.cancel(conversation_id) {
        info!("stopped generation for deleted conversation {conversation_id}");
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_messages(
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(current_user): ExtractUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<MessagesList>, ApiError> {
    let messages = conversation_service
        .list_messages(current_user, conversation_id)
        .await?;

    Ok(Json(MessagesList {
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

pub mod schemas {
    use crate::infrastructure::entities;
    use crate::infrastructure::entities::Role;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug, Default)]
    pub struct CreateConversation {
        pub title: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct UpdateConversation {
        pub title: String,
    }

    #[derive(Serialize, Debug)]
    pub struct Conversation {
        pub id: i64,
        pub title: String,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl From<entities::Conversation> for Conversation {
        fn from(conversation: entities::Conversation) -> Self {
            Conversation {
                id: conversation.id,
                title: conversation.title,
                created_at: conversation.created_at,
                updated_at: conversation.updated_at,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationList {
        pub conversations: Vec<Conversation>,
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationDetail {
        #[serde(flatten)]
        pub conversation: Conversation,
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Debug)]
    pub struct Message {
        pub id: i64,
        pub conversation_id: i64,
        pub role: Role,
        pub content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub image: Option<String>,
        pub created_at: DateTime<Utc>,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                id: message.id,
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                image: message.image,
                created_at: message.created_at,
            }
        }
    }
}
