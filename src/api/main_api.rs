use axum::response::IntoResponse;
use log::info;
use serde::Serialize;
use std::sync::Arc;

use crate::api::app_state::AppState;
use crate::api::endpoints::channels_api::channels_api_register;
use crate::api::endpoints::epg_api::epg_api_register;
use crate::api::endpoints::export_api::export_api_register;
use crate::api::endpoints::mappings_api::mappings_api_register;
use crate::api::endpoints::settings_api::settings_api_register;
use crate::api::endpoints::sources_api::sources_api_register;
use crate::VERSION;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    pub status: String,
    pub version: String,
    pub server_time: String,
}

fn create_healthcheck() -> Healthcheck {
    Healthcheck {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        server_time: chrono::offset::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

async fn healthcheck() -> impl IntoResponse {
    axum::Json(create_healthcheck())
}

fn create_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
            axum::http::Method::HEAD,
        ])
        .allow_headers(tower_http::cors::Any)
        .max_age(std::time::Duration::from_secs(3600))
}

pub fn create_router(app_state: Arc<AppState>) -> axum::Router<()> {
    let router = axum::Router::new()
        .route("/healthcheck", axum::routing::get(healthcheck))
        .merge(channels_api_register())
        .merge(epg_api_register())
        .merge(export_api_register())
        .merge(settings_api_register())
        .merge(sources_api_register())
        .merge(mappings_api_register())
        .layer(create_cors_layer());
    router.with_state(app_state)
}

pub async fn start_server(app_state: Arc<AppState>, host: &str, port: u16) -> std::io::Result<()> {
    let router = create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Server running: http://{host}:{port}");
    axum::serve(listener, router).await
}
