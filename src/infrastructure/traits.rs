//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use crate::infrastructure::entities::Role;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    ConversationNotFound(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<entities::Conversation>, StoreError>;

    async fn create_conversation(
        &self,
        user_id: Uuid,
        title: &str,
    ) -> Result<entities::Conversation, StoreError>;

    /// Returns `None` when the conversation does not exist or belongs to another user.
    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    async fn rename_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        title: &str,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    /// Returns `false` when nothing was deleted.
    async fn delete_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<bool, StoreError>;

    async fn list_conversation_messages(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Vec<entities::Message>, StoreError>;

    /// Inserts a message and bumps the conversation's `updated_at` in one
    /// transaction.
    async fn insert_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        image: Option<&str>,
    ) -> Result<entities::Message, StoreError>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn find_settings(&self, user_id: Uuid) -> Result<Option<entities::UserSettings>, StoreError>;

    async fn save_settings(
        &self,
        user_id: Uuid,
        settings: &entities::UserSettings,
    ) -> Result<(), StoreError>;
}
