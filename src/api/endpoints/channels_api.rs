use axum::response::IntoResponse;
use log::error;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::api_utils::{epg_error_response, resolve_playlist};
use crate::api::app_state::AppState;

#[derive(Debug, Deserialize)]
struct ChannelsQuery {
    playlist: Option<String>,
}

/// Parses the playlist and returns its channels plus the detected EPG hint.
async fn channels(
    axum::extract::Query(query): axum::extract::Query<ChannelsQuery>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    match resolve_playlist(&app_state, query.playlist.as_deref()).await {
        Ok(result) => axum::Json(result).into_response(),
        Err(err) => {
            error!("Failed to resolve playlist: {err}");
            epg_error_response(&err)
        }
    }
}

pub fn channels_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route("/api/channels", axum::routing::get(channels))
}
