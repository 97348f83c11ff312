//! Per-user generation settings

use crate::api::settings::schemas::{Settings, UpdateSettings};
use crate::api::{ApiError, ExtractUser};
use crate::core::traits::SettingsService;
use axum::routing::get;
use axum::{Json, Router};
use di_axum::Inject;

pub fn router() -> Router {
    Router::new().route("/", get(get_settings).put(update_settings))
}

async fn get_settings(
    Inject(settings_service): Inject<dyn SettingsService>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<Settings>, ApiError> {
    let settings = settings_service.get_settings(current_user).await?;

    Ok(Json(settings.into()))
}

async fn update_settings(
    Inject(settings_service): Inject<dyn SettingsService>,
    ExtractUser(current_user): ExtractUser,
    Json(update): Json<UpdateSettings>,
) -> Result<Json<Settings>, ApiError> {
    let settings = settings_service
        .update_settings(current_user, update.into())
        .await?;

    Ok(Json(settings.into()))
}

pub mod schemas {
    use crate::infrastructure::entities::{SettingsUpdate, UserSettings};
    use serde::{Deserialize, Deserializer, Serialize};

    #[derive(Serialize, Debug)]
    pub struct Settings {
        pub temperature: f64,
        pub top_k: i64,
        pub top_p: f64,
        pub repeat_penalty: f64,
        pub max_tokens: i64,
        pub system_prompt: String,
        pub model: String,
        pub server_url: Option<String>,
    }

    impl From<UserSettings> for Settings {
        fn from(settings: UserSettings) -> Self {
            Settings {
                temperature: settings.temperature,
                top_k: settings.top_k,
                top_p: settings.top_p,
                repeat_penalty: settings.repeat_penalty,
                max_tokens: settings.max_tokens,
                system_prompt: settings.system_prompt,
                model: settings.model,
                server_url: settings.server_url,
            }
        }
    }

    /// Partial update. An explicit `"server_url": null` removes the override,
    /// an absent key keeps it.
    #[derive(Deserialize, Debug, Default)]
    pub struct UpdateSettings {
        pub temperature: Option<f64>,
        pub top_k: Option<i64>,
        pub top_p: Option<f64>,
        pub repeat_penalty: Option<f64>,
        pub max_tokens: Option<i64>,
        pub system_prompt: Option<String>,
        pub model: Option<String>,
        #[serde(default, deserialize_with = "present")]
        pub server_url: Option<Option<String>>,
    }

    fn present<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }

    impl From<UpdateSettings> for SettingsUpdate {
        fn from(update: UpdateSettings) -> Self {
            SettingsUpdate {
                temperature: update.temperature,
                top_k: update.top_k,
                top_p: update.top_p,
                repeat_penalty: update.repeat_penalty,
                max_tokens: update.max_tokens,
                system_prompt: update.system_prompt,
                model: update.model,
                server_url: update.server_url,
            }
        }
    }

}
