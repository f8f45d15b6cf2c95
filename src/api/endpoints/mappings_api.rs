use axum::http::StatusCode;
use axum::response::IntoResponse;
use log::error;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::api_utils::error_response;
use crate::api::app_state::AppState;
use crate::model::ChannelMapping;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SingleMapping {
    channel_id: String,
    #[serde(flatten)]
    mapping: ChannelMapping,
}

/// Upsert body: either one mapping with an explicit `channelId` or a bulk
/// object keyed by playlist channel id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MappingsUpsert {
    Single(SingleMapping),
    Bulk(HashMap<String, ChannelMapping>),
}

async fn get_mappings(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    axum::Json(app_state.settings.snapshot().mappings.clone()).into_response()
}

async fn save_mappings(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
    axum::extract::Json(upsert): axum::extract::Json<MappingsUpsert>,
) -> impl IntoResponse + Send {
    let entries: Vec<(String, ChannelMapping)> = match upsert {
        MappingsUpsert::Single(single) => vec![(single.channel_id, single.mapping)],
        MappingsUpsert::Bulk(bulk) => bulk.into_iter().collect(),
    };
    if entries.iter().any(|(id, _)| id.trim().is_empty()) {
        return error_response(StatusCode::BAD_REQUEST, "Mapping channel id must not be empty");
    }

    let result = app_state
        .settings
        .update(move |doc| {
            for (channel_id, mapping) in entries {
                if mapping.is_noop() {
                    // an all-default mapping clears the override
                    doc.mappings.remove(&channel_id);
                } else {
                    doc.mappings.insert(channel_id, mapping);
                }
            }
        })
        .await;

    match result {
        Ok(document) => axum::Json(document.mappings.clone()).into_response(),
        Err(err) => {
            error!("Failed to save mappings: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

pub fn mappings_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new().route(
        "/api/mappings",
        axum::routing::get(get_mappings).post(save_mappings),
    )
}
