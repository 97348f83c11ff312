//! DB Repository abstractions

use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{Conversation, Message, Role, UserSettings};
use crate::infrastructure::traits::{ConversationRepository, SettingsRepository, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::error;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, user, title, created_at, updated_at";

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user = ? ORDER BY datetime(updated_at) DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?)
    }

    async fn create_conversation(&self, user_id: Uuid, title: &str) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        Ok(sqlx::query_as(&format!(
            "INSERT INTO conversations (user, title, created_at, updated_at) VALUES (?, ?, ?, ?) RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(user_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .fetch_one(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?)
    }

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ? AND user = ?"
        ))
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?)
    }

    async fn rename_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        title: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(sqlx::query_as(&format!(
            "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ? AND user = ? RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(title)
        .bind(Utc::now())
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?)
    }

    async fn delete_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ? AND user = ?")
            .bind(conversation_id)
            .bind(user_id)
            .execute(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_conversation_messages(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT messages.id, messages.conversation_id, messages.role, messages.content, messages.image, messages.created_at FROM messages INNER JOIN conversations ON conversations.id = messages.conversation_id WHERE messages.conversation_id = ? AND conversations.user = ? ORDER BY messages.id ASC",
        )
            .bind(conversation_id)
            .bind(user_id)
            .fetch_all(&**self.connection)
            .await
            .inspect_err(|e| error!("{e}"))?)
    }

    async fn insert_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        image: Option<&str>,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let mut tx = self.connection.begin().await?;

        let touched = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        if touched.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id));
        }

        let message = sqlx::query_as(
            "INSERT INTO messages (conversation_id, role, content, image, created_at) VALUES (?, ?, ?, ?, ?) RETURNING id, conversation_id, role, content, image, created_at",
        )
            .bind(conversation_id)
            .bind(role)
            .bind(content)
            .bind(image)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .inspect_err(|e| error!("{e}"))?;

        tx.commit().await?;

        Ok(message)
    }
}

#[injectable(SettingsRepository)]
pub struct DbSettingsRepository {
    connection: Ref<DatabaseConnection>,
}

#[async_trait]
impl SettingsRepository for DbSettingsRepository {
    async fn find_settings(&self, user_id: Uuid) -> Result<Option<UserSettings>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT temperature, top_k, top_p, repeat_penalty, max_tokens, system_prompt, model, server_url FROM user_settings WHERE user = ?",
        )
        .bind(user_id)
        .fetch_optional(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?)
    }

    async fn save_settings(&self, user_id: Uuid, settings: &UserSettings) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_settings (user, temperature, top_k, top_p, repeat_penalty, max_tokens, system_prompt, model, server_url) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user) DO UPDATE SET temperature = excluded.temperature, top_k = excluded.top_k, top_p = excluded.top_p, repeat_penalty = excluded.repeat_penalty, max_tokens = excluded.max_tokens, system_prompt = excluded.system_prompt, model = excluded.model, server_url = excluded.server_url",
        )
        .bind(user_id)
        .bind(settings.temperature)
        .bind(settings.top_k)
        .bind(settings.top_p)
        .bind(settings.repeat_penalty)
        .bind(settings.max_tokens)
        .bind(&settings.system_prompt)
        .bind(&settings.model)
        .bind(&settings.server_url)
        .execute(&**self.connection)
        .await
        .inspect_err(|e| error!("{e}"))?;

        Ok(())
    }
}
