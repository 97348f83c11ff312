//! Database entities

use crate::config::normalize_server;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub id: i64,
    pub user: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    /// Data URL of an image attached to a user message.
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UserSettings {
    pub temperature: f64,
    pub top_k: i64,
    pub top_p: f64,
    pub repeat_penalty: f64,
    pub max_tokens: i64,
    pub system_prompt: String,
    pub model: String,
    pub server_url: Option<String>,
}

/// Fields of [`UserSettings`] to overwrite; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsUpdate {
    pub temperature: Option<f64>,
    pub top_k: Option<i64>,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub max_tokens: Option<i64>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// `Some(None)` clears the override.
    pub server_url: Option<Option<String>>,
}

impl UserSettings {
    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(temperature) = update.temperature {
            self.temperature = temperature;
        }
        if let Some(top_k) = update.top_k {
            self.top_k = top_k;
        }
        if let Some(top_p) = update.top_p {
            self.top_p = top_p;
        }
        if let Some(repeat_penalty) = update.repeat_penalty {
            self.repeat_penalty = repeat_penalty;
        }
        if let Some(max_tokens) = update.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(system_prompt) = update.system_prompt {
            self.system_prompt = system_prompt;
        }
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(server_url) = update.server_url {
            self.server_url = server_url
                .map(|url| normalize_server(&url))
                .filter(|url| !url.is_empty());
        }
    }
}
