//! Models available on the user's inference server

use crate::api::{ApiError, ExtractUser};
use crate::core::inference::ModelInfo;
use crate::core::traits::{InferenceClient, SettingsService};
use axum::routing::get;
use axum::{Json, Router};
use di_axum::Inject;
use log::warn;
use serde::Serialize;

pub fn router() -> Router {
    Router::new().route("/", get(list_models))
}

#[derive(Serialize, Debug)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

async fn list_models(
    Inject(settings_service): Inject<dyn SettingsService>,
    Inject(inference): Inject<dyn InferenceClient>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<ModelList>, ApiError> {
    let params = settings_service.get_generation_params(current_user).await?;

    let data = inference
        .list_models(&params.target_server)
        .await
        .map_err(|e| {
            warn!("listing models at {} failed: {e}", params.target_server);
            ApiError::Upstream(e.to_string())
        })?;

    Ok(Json(ModelList { object: "list", data }))
}
