use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::api::app_state::AppState;
use crate::error::{EpgError, EpgErrorKind};
use crate::model::{AppSettings, PlaylistParseResult, SettingsDocument, TimeWindow};
use crate::processing::{parse_m3u, EpgAssembler};
use crate::utils::request::download_text_content;
use crate::utils::{now_millis, short_hash};

const PLAYLIST_CACHE_TTL: Duration = Duration::from_secs(60);
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub fn error_response(status: StatusCode, message: impl std::fmt::Display) -> axum::response::Response {
    (status, axum::Json(json!({"error": message.to_string()}))).into_response()
}

pub fn epg_error_response(err: &EpgError) -> axum::response::Response {
    let status = match err.kind {
        EpgErrorKind::Input => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err)
}

pub fn assembler_for(state: &AppState) -> EpgAssembler<'_> {
    EpgAssembler {
        client: &state.http_client,
        mirror: &state.mirror,
        schedule_cache: &state.schedule_cache,
    }
}

/// Loads the playlist from the query parameter or the configured default.
/// No playlist at all yields an empty channel set, which downstream turns
/// into one accept-all group per source.
pub async fn resolve_playlist(
    state: &AppState,
    playlist_param: Option<&str>,
) -> Result<PlaylistParseResult, EpgError> {
    let document = state.settings.snapshot();
    let url = playlist_param
        .map(ToString::to_string)
        .or_else(|| document.settings.playlist_url.clone());
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return Ok(PlaylistParseResult::default());
    };

    let cache_key = format!("playlist-{}", short_hash(&url));
    if let Some(cached) = state.playlist_cache.get::<PlaylistParseResult>(&cache_key).await {
        return Ok(cached);
    }

    let content = match Url::parse(&url) {
        Ok(parsed) if parsed.scheme().starts_with("http") => {
            download_text_content(&state.http_client, &parsed).await?
        }
        _ => tokio::fs::read_to_string(&url).await.map_err(|err| {
            EpgError::new(EpgErrorKind::Input, format!("Cannot read playlist {url}: {err}"))
        })?,
    };

    let result = parse_m3u(&content);
    state.playlist_cache.set(&cache_key, &result, PLAYLIST_CACHE_TTL).await;
    Ok(result)
}

/// Default EPG URL precedence: explicit query parameter, configured default,
/// then the playlist header hint when `usePlaylistEpg` is on.
pub fn resolve_default_epg_url(
    document: &SettingsDocument,
    epg_param: Option<&str>,
    playlist_hint: Option<&str>,
) -> Option<String> {
    epg_param
        .filter(|u| !u.is_empty())
        .map(ToString::to_string)
        .or_else(|| document.settings.epg_url.clone().filter(|u| !u.is_empty()))
        .or_else(|| {
            if document.settings.use_playlist_epg {
                playlist_hint.filter(|u| !u.is_empty()).map(ToString::to_string)
            } else {
                None
            }
        })
}

pub fn window_from_days(past_days: u32, future_days: u32) -> TimeWindow {
    let now = now_millis();
    TimeWindow::Range {
        from_ms: now - i64::from(past_days) * DAY_MS,
        to_ms: now + i64::from(future_days) * DAY_MS,
    }
}

pub fn default_window(settings: &AppSettings) -> TimeWindow {
    window_from_days(settings.past_days, settings.future_days)
}
