use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::Utc;
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use crate::api::api_utils::{error_response, epg_error_response};
use crate::api::app_state::AppState;
use crate::model::Source;
use crate::processing::{parse_xmltv_file, ParseOptions, XmltvEvent};
use crate::repository::{generate_source_id, SourceChannels};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceUpsert {
    id: Option<String>,
    url: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    priority: i16,
}

const fn default_true() -> bool {
    true
}

async fn list_sources(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    axum::Json(app_state.settings.snapshot().sources.clone()).into_response()
}

async fn save_source(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
    axum::extract::Json(upsert): axum::extract::Json<SourceUpsert>,
) -> impl IntoResponse + Send {
    let url = upsert.url.trim().to_string();
    if Url::parse(&url).map(|u| !u.scheme().starts_with("http")).unwrap_or(true) {
        return error_response(StatusCode::BAD_REQUEST, "Source url must be a http(s) URL");
    }

    let existing_id = upsert.id.filter(|id| !id.is_empty());
    if let Some(id) = &existing_id {
        if app_state.settings.snapshot().source_by_id(id).is_none() {
            return error_response(StatusCode::NOT_FOUND, format!("Unknown source {id}"));
        }
    }
    let source_id = existing_id.clone().unwrap_or_else(|| generate_source_id(&url));

    let update_id = source_id.clone();
    let result = app_state
        .settings
        .update(move |doc| {
            if let Some(source) = doc.sources.iter_mut().find(|s| s.id == update_id) {
                source.url = url;
                source.enabled = upsert.enabled;
                source.priority = upsert.priority;
            } else {
                doc.sources.push(Source {
                    id: update_id,
                    url,
                    enabled: upsert.enabled,
                    priority: upsert.priority,
                    last_scanned_at: None,
                    channel_count: None,
                });
            }
        })
        .await;

    match result {
        Ok(document) => match document.source_by_id(&source_id) {
            Some(source) => axum::Json(source.clone()).into_response(),
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "Source vanished after save"),
        },
        Err(err) => {
            error!("Failed to save source: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

async fn delete_source(
    axum::extract::Path(source_id): axum::extract::Path<String>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    if app_state.settings.snapshot().source_by_id(&source_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown source {source_id}"));
    }

    let remove_id = source_id.clone();
    match app_state.settings.update(move |doc| doc.sources.retain(|s| s.id != remove_id)).await {
        Ok(_) => {
            app_state.source_channels.remove(&source_id).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to delete source: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
    }
}

/// Refreshes the mirror of one source and extracts its channel list via a
/// channels-only streaming pass.
async fn rescan_source(
    axum::extract::Path(source_id): axum::extract::Path<String>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    let document = app_state.settings.snapshot();
    let Some(source) = document.source_by_id(&source_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown source {source_id}"));
    };

    let mirror_file = match app_state
        .mirror
        .fetch(&app_state.http_client, &source.url, document.settings.history_retention_days)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            error!("Rescan fetch failed for {source_id}: {err}");
            return epg_error_response(&err);
        }
    };

    let mut channels = Vec::new();
    let mut callback = |event: XmltvEvent| {
        if let XmltvEvent::Channel(channel) = event {
            channels.push(channel);
        }
    };
    if let Err(err) = parse_xmltv_file(&mirror_file.path, &ParseOptions::channels_only(), &mut callback).await {
        error!("Rescan parse failed for {source_id}: {err}");
        return epg_error_response(&err);
    }

    let scanned_at = Utc::now().to_rfc3339();
    let record = SourceChannels { channels, scanned_at: scanned_at.clone() };
    if let Err(err) = app_state.source_channels.write(&source_id, &record).await {
        error!("Failed to persist rescan result for {source_id}: {err}");
    }

    let channel_count = record.channels.len();
    let update_id = source_id.clone();
    let update_scanned_at = scanned_at.clone();
    if let Err(err) = app_state
        .settings
        .update(move |doc| {
            if let Some(source) = doc.sources.iter_mut().find(|s| s.id == update_id) {
                source.last_scanned_at = Some(update_scanned_at);
                source.channel_count = Some(channel_count);
            }
        })
        .await
    {
        error!("Failed to update source after rescan: {err}");
    }

    axum::Json(json!({
        "id": source_id,
        "channelCount": channel_count,
        "scannedAt": scanned_at,
    }))
    .into_response()
}

async fn source_channels(
    axum::extract::Path(source_id): axum::extract::Path<String>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    if app_state.settings.snapshot().source_by_id(&source_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown source {source_id}"));
    }
    match app_state.source_channels.read(&source_id).await {
        Some(record) => axum::Json(record).into_response(),
        None => axum::Json(SourceChannels { channels: vec![], scanned_at: String::new() }).into_response(),
    }
}

pub fn sources_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/api/sources", axum::routing::get(list_sources).post(save_source))
        .route("/api/sources/{source_id}", axum::routing::delete(delete_source))
        .route("/api/sources/{source_id}/rescan", axum::routing::post(rescan_source))
        .route("/api/sources/{source_id}/channels", axum::routing::get(source_channels))
}
