use std::path::PathBuf;

use crate::error::EpgError;
use crate::processing::PrewarmScheduler;
use crate::repository::{ArtifactCache, MirrorStore, SettingsStore, SourceChannelCache};

/// Shared state handed to every request handler. Every field is internally
/// synchronized; the whole struct lives behind one `Arc`.
pub struct AppState {
    pub http_client: reqwest::Client,
    pub settings: SettingsStore,
    pub mirror: MirrorStore,
    pub schedule_cache: ArtifactCache,
    pub playlist_cache: ArtifactCache,
    pub source_channels: SourceChannelCache,
    pub prewarm: PrewarmScheduler,
    pub exports_dir: PathBuf,
}

impl AppState {
    pub async fn create(data_dir: PathBuf) -> Result<Self, EpgError> {
        let exports_dir = data_dir.join("cache").join("exports");
        crate::utils::ensure_dir(&exports_dir)?;
        Ok(Self {
            http_client: crate::utils::request::create_client(),
            settings: SettingsStore::load(data_dir.join("settings.json")).await?,
            mirror: MirrorStore::new(data_dir.join("mirror"))?,
            schedule_cache: ArtifactCache::new(data_dir.join("cache").join("schedules"))?,
            playlist_cache: ArtifactCache::new(data_dir.join("cache").join("playlists"))?,
            source_channels: SourceChannelCache::new(data_dir.join("source-cache"))?,
            prewarm: PrewarmScheduler::new(),
            exports_dir,
        })
    }

    pub fn export_artifact_path(&self, fingerprint: &str, gzip: bool) -> PathBuf {
        let ext = if gzip { "xml.gz" } else { "xml" };
        self.exports_dir.join(format!("{fingerprint}.{ext}"))
    }
}
