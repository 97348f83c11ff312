//! DI "Interfaces"

use crate::core::inference::{
    ChatMessage, CompletionRequest, FragmentStream, GenerationParams, InferenceError, ModelInfo,
};
use crate::core::services::SettingsError;
use crate::infrastructure::entities;
use crate::infrastructure::entities::Role;
use crate::infrastructure::traits::StoreError;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Lists all conversations for the given user, most recently active first.
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<entities::Conversation>, StoreError>;

    /// Creates a new, empty conversation for the given user.
    async fn create_conversation(
        &self,
        user_id: Uuid,
        title: Option<String>,
    ) -> Result<entities::Conversation, StoreError>;

    /// Returns `None` if the conversation does not exist or belongs to someone else.
    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    async fn rename_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        title: String,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    /// Deletes a conversation together with its messages.
    ///
    /// Returns `false` if the conversation did not exist or the user didn't own it.
    async fn delete_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<bool, StoreError>;

    /// List all messages in a conversation, oldest first.
    ///
    /// Foreign conversations list as empty.
    async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Vec<entities::Message>, StoreError>;

    /// Appends a message to a conversation and returns the stored row.
    ///
    /// The helper functions `create_X_message` should be used instead for clarity.
    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
        image: Option<String>,
    ) -> Result<entities::Message, StoreError>;

    /// The conversation as the inference server sees it: role and text, in order.
    async fn get_history(&self, user_id: Uuid, conversation_id: i64) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .list_messages(user_id, conversation_id)
            .await?
            .into_iter()
            .map(ChatMessage::from)
            .collect())
    }

    /// Names a conversation after its first user message, unless it has
    /// already been given a title.
    async fn auto_title(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        first_message: &str,
    ) -> Result<(), StoreError>;

    /// Create a new user message in a conversation.
    async fn create_user_message(
        &self,
        conversation_id: i64,
        message: String,
        image: Option<String>,
    ) -> Result<entities::Message, StoreError> {
        self.append_message(conversation_id, Role::User, message, image)
            .await
    }

    /// Create a new assistant message in a conversation.
    async fn create_assistant_message(
        &self,
        conversation_id: i64,
        message: String,
    ) -> Result<entities::Message, StoreError> {
        self.append_message(conversation_id, Role::Assistant, message, None)
            .await
    }
}

#[async_trait]
pub trait SettingsService: Send + Sync {
    /// Returns the user's settings, storing the configured defaults on first access.
    async fn get_settings(&self, user_id: Uuid) -> Result<entities::UserSettings, StoreError>;

    /// Validates and applies a partial update.
    async fn update_settings(
        &self,
        user_id: Uuid,
        update: entities::SettingsUpdate,
    ) -> Result<entities::UserSettings, SettingsError>;

    /// Everything a completion request needs, with the target server resolved.
    async fn get_generation_params(&self, user_id: Uuid) -> Result<GenerationParams, StoreError>;
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Opens a streaming chat completion. The returned stream is lazy, finite
    /// and holds the upstream connection until it is dropped.
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<FragmentStream, InferenceError>;

    /// Lists the models served at `target_server`.
    async fn list_models(&self, target_server: &str) -> Result<Vec<ModelInfo>, InferenceError>;
}
