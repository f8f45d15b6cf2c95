use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::api_utils::{assembler_for, default_window, epg_error_response, error_response, resolve_default_epg_url, resolve_playlist};
use crate::api::app_state::AppState;
use crate::model::{normalize_channel_id, FingerprintKind, PlaylistChannel, TimeWindow};

#[derive(Debug, Deserialize)]
struct EpgQuery {
    playlist: Option<String>,
    epg: Option<String>,
    debug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    id: Option<String>,
    from: Option<i64>,
    to: Option<i64>,
    playlist: Option<String>,
}

/// Assembled schedules for the default window.
async fn epg(
    axum::extract::Query(query): axum::extract::Query<EpgQuery>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    let document = app_state.settings.snapshot();
    let playlist = match resolve_playlist(&app_state, query.playlist.as_deref()).await {
        Ok(playlist) => playlist,
        Err(err) => return epg_error_response(&err),
    };
    let default_epg_url = resolve_default_epg_url(&document, query.epg.as_deref(), playlist.epg_url.as_deref());
    let window = default_window(&document.settings);

    let assembler = assembler_for(&app_state);
    match assembler
        .assemble(&document, &playlist.channels, default_epg_url.as_deref(), &window)
        .await
    {
        Ok(outcome) => {
            if query.debug.as_deref().is_some_and(|d| d == "1" || d == "true") {
                let programme_count: usize = outcome.epg.channels.iter().map(|c| c.programmes.len()).sum();
                return axum::Json(json!({
                    "channels": outcome.epg.channels,
                    "debug": {
                        "channelCount": outcome.epg.channels.len(),
                        "programmeCount": programme_count,
                        "fingerprint": outcome.fingerprint.hash(),
                    }
                }))
                .into_response();
            }
            axum::Json(outcome.epg).into_response()
        }
        Err(err) => {
            error!("EPG assembly failed: {err}");
            epg_error_response(&err)
        }
    }
}

/// One channel's schedules in `[from, to)`, with the fingerprint served as
/// `ETag` and honored via `If-None-Match`.
async fn epg_channel(
    axum::extract::Query(query): axum::extract::Query<ChannelQuery>,
    headers: axum::http::HeaderMap,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    let Some(channel_id) = query.id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required parameter: id");
    };

    let document = app_state.settings.snapshot();
    let playlist = match resolve_playlist(&app_state, query.playlist.as_deref()).await {
        Ok(playlist) => playlist,
        Err(err) => return epg_error_response(&err),
    };
    let default_epg_url = resolve_default_epg_url(&document, None, playlist.epg_url.as_deref());

    let normalized = normalize_channel_id(&channel_id);
    let selected: Vec<PlaylistChannel> = playlist
        .channels
        .iter()
        .filter(|c| normalize_channel_id(&c.id) == normalized)
        .cloned()
        .collect();
    let selected = if selected.is_empty() {
        // not part of the playlist, query the EPG side directly
        vec![PlaylistChannel {
            id: channel_id.clone(),
            name: None,
            group: None,
            logo_url: None,
            stream_url: String::new(),
        }]
    } else {
        selected
    };

    let window = match (query.from, query.to) {
        (Some(from_ms), Some(to_ms)) if from_ms < to_ms => TimeWindow::Range { from_ms, to_ms },
        (Some(_), Some(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid window: from must be before to");
        }
        _ => default_window(&document.settings),
    };

    let assembler = assembler_for(&app_state);
    match assembler
        .assemble(&document, &selected, default_epg_url.as_deref(), &window)
        .await
    {
        Ok(outcome) => {
            let etag = outcome.fingerprint.with_kind(FingerprintKind::Channel).hash();
            if headers
                .get(header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim_matches('"') == etag)
            {
                return StatusCode::NOT_MODIFIED.into_response();
            }
            (
                [(header::ETAG, etag)],
                axum::Json(outcome.epg.channels.into_iter().next()),
            )
                .into_response()
        }
        Err(err) => {
            error!("EPG channel assembly failed: {err}");
            epg_error_response(&err)
        }
    }
}

pub fn epg_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/api/epg", axum::routing::get(epg))
        .route("/api/epg/channel", axum::routing::get(epg_channel))
}
