use axum::http::StatusCode;
use axum::response::IntoResponse;
use log::error;
use std::sync::Arc;

use crate::api::api_utils::error_response;
use crate::api::app_state::AppState;
use crate::model::AppSettings;

async fn get_settings(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    axum::Json(app_state.settings.snapshot().settings.clone()).into_response()
}

async fn save_settings(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
    axum::extract::Json(settings): axum::extract::Json<AppSettings>,
) -> impl IntoResponse + Send {
    if settings.past_days > 365 || settings.future_days > 365 {
        return error_response(StatusCode::BAD_REQUEST, "Window days out of range");
    }
    if settings.history_retention_days == 0 {
        return error_response(StatusCode::BAD_REQUEST, "historyRetentionDays must be positive");
    }

    match app_state.settings.update(|doc| doc.settings = settings).await {
        Ok(document) => axum::Json(document.settings.clone()).into_response(),
        Err(err) => {
            error!("Failed to save settings: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

pub fn settings_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route(
        "/api/settings",
        axum::routing::get(get_settings).post(save_settings),
    )
}
