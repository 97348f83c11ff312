//! Implementations for the service the app needs.
//!

use crate::config::AppConfig;
use crate::core::inference::GenerationParams;
use crate::core::traits::{ConversationService, SettingsService};
use crate::infrastructure::entities::{
    Conversation, DEFAULT_TITLE, Message, Role, SettingsUpdate, UserSettings,
};
use crate::infrastructure::traits::{ConversationRepository, SettingsRepository, StoreError};
use async_trait::async_trait;
use di::{Ref, injectable};
use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

const TITLE_LENGTH: usize = 50;

#[injectable(ConversationService)]
pub struct MyConversationService {
    repo: Ref<dyn ConversationRepository>,
}

#[async_trait]
impl ConversationService for MyConversationService {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        self.repo.list_conversations(user_id).await
    }

    async fn create_conversation(
        &self,
        user_id: Uuid,
        title: Option<String>,
    ) -> Result<Conversation, StoreError> {
        let title = title
            .map(|title| title.trim().to_owned())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_owned());

        self.repo.create_conversation(user_id, &title).await
    }

    async fn get_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Option<Conversation>, StoreError> {
        self.repo.get_conversation(user_id, conversation_id).await
    }

    async fn rename_conversation(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        title: String,
    ) -> Result<Option<Conversation>, StoreError> {
        self.repo
            .rename_conversation(user_id, conversation_id, title.trim())
            .await
    }

    async fn delete_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<bool, StoreError> {
        self.repo.delete_conversation(user_id, conversation_id).await
    }

    async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        self.repo
            .list_conversation_messages(user_id, conversation_id)
            .await
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
        image: Option<String>,
    ) -> Result<Message, StoreError> {
        self.repo
            .insert_message(conversation_id, role, &content, image.as_deref())
            .await
    }

    async fn auto_title(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        first_message: &str,
    ) -> Result<(), StoreError> {
        let Some(conversation) = self.repo.get_conversation(user_id, conversation_id).await? else {
            return Err(StoreError::ConversationNotFound(conversation_id));
        };

        if conversation.title != DEFAULT_TITLE {
            return Ok(());
        }

        let title = derive_title(first_message);
        if title.is_empty() {
            return Ok(());
        }

        info!("titling conversation {conversation_id}: {title}");
        self.repo
            .rename_conversation(user_id, conversation_id, &title)
            .await?;

        Ok(())
    }
}

/// First characters of a message, with an ellipsis when it had to be cut.
pub fn derive_title(message: &str) -> String {
    let mut chars = message.chars();
    let head: String = chars.by_ref().take(TITLE_LENGTH).collect();
    let mut title = head.trim().to_owned();

    if chars.next().is_some() {
        title.push_str("...");
    }

    title
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("`{0}` is not an allowed inference server")]
    ServerNotAllowed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn check_range(field: &'static str, value: Option<f64>, min: f64, max: f64) -> Result<(), SettingsError> {
    match value {
        Some(value) if !(min..=max).contains(&value) => {
            Err(SettingsError::OutOfRange { field, min, max })
        }
        _ => Ok(()),
    }
}

impl SettingsUpdate {
    pub fn validate(&self, config: &AppConfig) -> Result<(), SettingsError> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_k", self.top_k.map(|v| v as f64), 1.0, 100.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("repeat_penalty", self.repeat_penalty, 1.0, 2.0)?;
        check_range("max_tokens", self.max_tokens.map(|v| v as f64), 1.0, 8192.0)?;

        if let Some(Some(url)) = &self.server_url {
            if !url.trim().is_empty() && !config.is_allowed_server(url) {
                return Err(SettingsError::ServerNotAllowed(url.trim().to_owned()));
            }
        }
        Ok(())
    }
}

#[injectable(SettingsService)]
pub struct MySettingsService {
    repo: Ref<dyn SettingsRepository>,
    config: Ref<AppConfig>,
}

impl MySettingsService {
    fn defaults(&self) -> UserSettings {
        let defaults = &self.config.defaults;
        UserSettings {
            temperature: defaults.temperature,
            top_k: defaults.top_k,
            top_p: defaults.top_p,
            repeat_penalty: defaults.repeat_penalty,
            max_tokens: defaults.max_tokens,
            system_prompt: defaults.system_prompt.clone(),
            model: defaults.model.clone(),
            server_url: None,
        }
    }
}

#[async_trait]
impl SettingsService for MySettingsService {
    async fn get_settings(&self, user_id: Uuid) -> Result<UserSettings, StoreError> {
        if let Some(settings) = self.repo.find_settings(user_id).await? {
            return Ok(settings);
        }

        let settings = self.defaults();
        self.repo.save_settings(user_id, &settings).await?;
        Ok(settings)
    }

    async fn update_settings(
        &self,
        user_id: Uuid,
        update: SettingsUpdate,
    ) -> Result<UserSettings, SettingsError> {
        update.validate(&self.config)?;

        let mut settings = self.get_settings(user_id).await?;
        settings.apply(update);
        self.repo.save_settings(user_id, &settings).await?;

        Ok(settings)
    }

    async fn get_generation_params(&self, user_id: Uuid) -> Result<GenerationParams, StoreError> {
        let settings = self.get_settings(user_id).await?;

        let target_server = match settings.server_url {
            Some(url) if self.config.is_allowed_server(&url) => url,
            Some(url) => {
                warn!("stored server `{url}` is no longer allowed, using the default");
                self.config.llama_url.clone()
            }
            None => self.config.llama_url.clone(),
        };

        Ok(GenerationParams {
            temperature: settings.temperature,
            top_k: settings.top_k,
            top_p: settings.top_p,
            repeat_penalty: settings.repeat_penalty,
            max_tokens: settings.max_tokens,
            system_prompt: settings.system_prompt,
            model: settings.model,
            target_server,
        })
    }
}
