use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::api_utils::{assembler_for, epg_error_response, error_response, resolve_default_epg_url, resolve_playlist, window_from_days};
use crate::api::app_state::AppState;
use crate::model::{AppSettings, FingerprintKind, TimeWindow};
use crate::processing::{artifact_is_valid, render_export_to_file, FingerprintOutcome};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportQuery {
    past_days: Option<u32>,
    future_days: Option<u32>,
    full: Option<String>,
    playlist: Option<String>,
    epg: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrewarmRequest {
    past_days: Option<u32>,
    future_days: Option<u32>,
    full: Option<bool>,
    playlist: Option<String>,
    epg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    key: Option<String>,
}

fn flag_is_set(value: Option<&str>) -> bool {
    value.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Absent window parameters imply a full export.
fn export_window(settings: &AppSettings, past_days: Option<u32>, future_days: Option<u32>, full: bool) -> TimeWindow {
    if full || (past_days.is_none() && future_days.is_none()) {
        return TimeWindow::Full;
    }
    window_from_days(
        past_days.unwrap_or(settings.past_days),
        future_days.unwrap_or(settings.future_days),
    )
}

fn sanitize_filename(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Runs the pipeline and streams the export artifact, building it first
/// when no valid artifact exists for the fingerprint.
async fn build_export_response(app_state: &Arc<AppState>, query: ExportQuery, gzip: bool) -> axum::response::Response {
    let document = app_state.settings.snapshot();
    let playlist = match resolve_playlist(app_state, query.playlist.as_deref()).await {
        Ok(playlist) => playlist,
        Err(err) => return epg_error_response(&err),
    };
    let default_epg_url = resolve_default_epg_url(&document, query.epg.as_deref(), playlist.epg_url.as_deref());
    let window = export_window(
        &document.settings,
        query.past_days,
        query.future_days,
        flag_is_set(query.full.as_deref()),
    );

    let assembler = assembler_for(app_state);
    let outcome = match assembler
        .assemble(&document, &playlist.channels, default_epg_url.as_deref(), &window)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Export assembly failed: {err}");
            return epg_error_response(&err);
        }
    };

    let kind = if gzip { FingerprintKind::ExportGz } else { FingerprintKind::ExportXml };
    let fingerprint = outcome.fingerprint.with_kind(kind).hash();
    let artifact_path = app_state.export_artifact_path(&fingerprint, gzip);

    if !artifact_is_valid(&artifact_path) {
        if let Err(err) = render_export_to_file(
            artifact_path.clone(),
            Arc::new(outcome.epg),
            Arc::clone(&document),
            gzip,
        )
        .await
        {
            error!("Export rendering failed: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err);
        }
    }

    let file = match tokio::fs::File::open(&artifact_path).await {
        Ok(file) => file,
        Err(err) => {
            error!("Export artifact unreadable {}: {err}", artifact_path.display());
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Export artifact unreadable");
        }
    };

    let default_name = if gzip { "epg.xml.gz" } else { "epg.xml" };
    let filename = query
        .filename
        .as_deref()
        .filter(|f| !f.is_empty())
        .map_or_else(|| default_name.to_string(), sanitize_filename);
    let content_type = if gzip { "application/gzip" } else { mime::TEXT_XML.as_ref() };

    let body = axum::body::Body::from_stream(ReaderStream::new(file));
    match axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\""))
        .header(header::ETAG, fingerprint)
        .body(body)
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn export_gz(
    axum::extract::Query(query): axum::extract::Query<ExportQuery>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    build_export_response(&app_state, query, true).await
}

async fn export_xml(
    axum::extract::Query(query): axum::extract::Query<ExportQuery>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    build_export_response(&app_state, query, false).await
}

fn export_url_for(request: &PrewarmRequest) -> String {
    let mut params: Vec<String> = Vec::new();
    if request.full.unwrap_or(false) {
        params.push("full=1".to_string());
    }
    if let Some(past_days) = request.past_days {
        params.push(format!("pastDays={past_days}"));
    }
    if let Some(future_days) = request.future_days {
        params.push(format!("futureDays={future_days}"));
    }
    if let Some(playlist) = request.playlist.as_deref().filter(|p| !p.is_empty()) {
        params.push(format!("playlist={}", urlencode(playlist)));
    }
    if let Some(epg) = request.epg.as_deref().filter(|e| !e.is_empty()) {
        params.push(format!("epg={}", urlencode(epg)));
    }
    if params.is_empty() {
        "/api/export/epg.xml.gz".to_string()
    } else {
        format!("/api/export/epg.xml.gz?{}", params.join("&"))
    }
}

fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Builds the gzip export artifact in the background, updating the job
/// record as the pipeline advances.
async fn run_prewarm_job(app_state: Arc<AppState>, job_key: String, request: PrewarmRequest) {
    app_state.prewarm.set_running(&job_key, 10, "fetching sources").await;

    let document = app_state.settings.snapshot();
    let playlist = match resolve_playlist(&app_state, request.playlist.as_deref()).await {
        Ok(playlist) => playlist,
        Err(err) => {
            app_state.prewarm.finish(&job_key, Err(err.to_string())).await;
            return;
        }
    };
    let default_epg_url = resolve_default_epg_url(&document, request.epg.as_deref(), playlist.epg_url.as_deref());
    let window = export_window(
        &document.settings,
        request.past_days,
        request.future_days,
        request.full.unwrap_or(false),
    );

    let assembler = assembler_for(&app_state);
    let outcome = match assembler
        .assemble(&document, &playlist.channels, default_epg_url.as_deref(), &window)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            app_state.prewarm.finish(&job_key, Err(err.to_string())).await;
            return;
        }
    };

    app_state.prewarm.set_running(&job_key, 60, "sources ready").await;

    let fingerprint = outcome.fingerprint.with_kind(FingerprintKind::ExportGz).hash();
    if let FingerprintOutcome::Attached = app_state.prewarm.register_fingerprint(&job_key, &fingerprint).await {
        // an identical build is already underway, this job joins it
        return;
    }

    let artifact_path = app_state.export_artifact_path(&fingerprint, true);
    if artifact_is_valid(&artifact_path) {
        app_state.prewarm.finish(&job_key, Ok(())).await;
        return;
    }

    app_state.prewarm.set_running(&job_key, 80, "rendering export").await;
    let result = render_export_to_file(artifact_path, Arc::new(outcome.epg), Arc::clone(&document), true)
        .await
        .map_err(|err| err.to_string());
    app_state.prewarm.finish(&job_key, result).await;
}

async fn prewarm(
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
    axum::extract::Json(request): axum::extract::Json<PrewarmRequest>,
) -> impl IntoResponse + Send {
    let export_url = export_url_for(&request);
    let key = app_state.prewarm.create_job(export_url.clone()).await;

    let job_state = Arc::clone(&app_state);
    let job_key = key.clone();
    tokio::spawn(async move {
        run_prewarm_job(job_state, job_key, request).await;
    });

    axum::Json(json!({"key": key, "started": true, "exportUrl": export_url})).into_response()
}

async fn prewarm_status(
    axum::extract::Query(query): axum::extract::Query<StatusQuery>,
    axum::extract::State(app_state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse + Send {
    let Some(key) = query.key.filter(|k| !k.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required parameter: key");
    };
    match app_state.prewarm.status(&key).await {
        Some(status) => axum::Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown job key"),
    }
}

pub fn export_api_register() -> axum::Router<Arc<AppState>> {
    axum::Router::new()
        .route("/epg.xml.gz", axum::routing::get(export_gz))
        .route("/api/export/epg.xml.gz", axum::routing::get(export_gz))
        .route("/epg.xml", axum::routing::get(export_xml))
        .route("/api/export/epg.xml", axum::routing::get(export_xml))
        .route("/api/export/prewarm", axum::routing::post(prewarm))
        .route("/api/export/status", axum::routing::get(prewarm_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_window_defaults_to_full() {
        let settings = AppSettings::default();
        assert!(export_window(&settings, None, None, false).is_full());
        assert!(export_window(&settings, Some(1), None, true).is_full());
        assert!(!export_window(&settings, Some(1), None, false).is_full());
    }

    #[test]
    fn test_export_url_for() {
        let request = PrewarmRequest {
            past_days: Some(7),
            future_days: Some(3),
            playlist: Some("http://h/p.m3u".to_string()),
            ..Default::default()
        };
        assert_eq!(
            export_url_for(&request),
            "/api/export/epg.xml.gz?pastDays=7&futureDays=3&playlist=http%3A%2F%2Fh%2Fp.m3u"
        );
        assert_eq!(export_url_for(&PrewarmRequest::default()), "/api/export/epg.xml.gz");
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag_is_set(Some("1")));
        assert!(flag_is_set(Some("true")));
        assert!(!flag_is_set(Some("0")));
        assert!(!flag_is_set(None));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("guide.xml.gz"), "guide.xml.gz");
        assert_eq!(sanitize_filename("a/b\"c.xml"), "a_b_c.xml");
    }
}
