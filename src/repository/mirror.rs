use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use futures::TryStreamExt;
use log::{debug, warn};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::error::{create_epg_error, EpgError, EpgErrorKind};
use crate::model::MirrorSignature;
use crate::utils::request::{format_http_status, sanitize_sensitive_info};
use crate::utils::{async_file_writer, ensure_dir, short_hash, temp_path, write_json_file, FetchLockManager, XMLTV_DATETIME_FMT};

pub const MIRROR_KEEP_MAX: usize = 40;
const RETRY_DELAY_MS: u64 = 500;
const SNAPSHOT_COLLISION_RETRIES: u32 = 5;
const SIGNATURE_SNAPSHOT_COUNT: usize = 5;

const EXT_PLAIN: &str = "xmltv";
const EXT_GZ: &str = "xmltv.gz";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub is_gz: bool,
    #[serde(default)]
    pub saved_at: String,
}

#[derive(Debug, Clone)]
pub struct MirrorFile {
    pub url: String,
    pub path: PathBuf,
    pub is_gz: bool,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub timestamp: String,
}

/// On-disk mirror of upstream feeds, one current file plus rotated
/// snapshots per URL. All mutation for one URL runs under its fetch lock.
pub struct MirrorStore {
    dir: PathBuf,
    fetch_locks: FetchLockManager,
}

impl MirrorStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        ensure_dir(&dir)?;
        Ok(Self { dir, fetch_locks: FetchLockManager::new() })
    }

    #[inline]
    pub fn url_key(url: &str) -> String {
        short_hash(url)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn current_path(&self, key: &str, is_gz: bool) -> PathBuf {
        let ext = if is_gz { EXT_GZ } else { EXT_PLAIN };
        self.dir.join(format!("{key}.{ext}"))
    }

    async fn read_meta(&self, key: &str) -> Option<MirrorMeta> {
        crate::utils::read_json_file(&self.meta_path(key)).await.ok()
    }

    /// Revalidates the mirror of `url` and returns its current file.
    ///
    /// Conditional GET with the stored validators; 304 keeps the file, a
    /// changed body rotates the old file into a snapshot before the new one
    /// is written via `tmp -> rename`. A 5xx is retried once. When upstream
    /// stays unreachable but a mirror exists, the mirror is served.
    pub async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &str,
        retention_days: u32,
    ) -> Result<MirrorFile, EpgError> {
        let key = Self::url_key(url);
        let _lock = self.fetch_locks.lock(url).await;

        let meta = self.read_meta(&key).await;
        let existing = match &meta {
            Some(m) => {
                let path = self.current_path(&key, m.is_gz);
                tokio::fs::metadata(&path).await.is_ok().then_some((path, m.is_gz))
            }
            None => None,
        };

        let conditional = existing.is_some();
        let response = match self.send(client, url, meta.as_ref().filter(|_| conditional)).await {
            Ok(response) => response,
            Err(err) => {
                if let Some((path, is_gz)) = &existing {
                    warn!("Upstream unavailable, serving mirror for {}: {err}", sanitize_sensitive_info(url));
                    return Ok(MirrorFile { url: url.to_string(), path: path.clone(), is_gz: *is_gz });
                }
                return Err(err);
            }
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some((path, is_gz)) = &existing {
                debug!("Mirror still fresh for {}", sanitize_sensitive_info(url));
                return Ok(MirrorFile { url: url.to_string(), path: path.clone(), is_gz: *is_gz });
            }
            // validators matched but the file was rotated away, start over
            let response = self.send(client, url, None).await?;
            return self.store_response(&key, url, response, existing, retention_days).await;
        }

        self.store_response(&key, url, response, existing, retention_days).await
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        url: &str,
        meta: Option<&MirrorMeta>,
    ) -> Result<reqwest::Response, EpgError> {
        let mut first = client.get(url);
        if let Some(m) = meta {
            if let Some(etag) = m.etag.as_deref() {
                first = first.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = m.last_modified.as_deref() {
                first = first.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        match first.send().await {
            Ok(response) if response.status().is_server_error() => {
                tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                let retry = client.get(url).send().await.map_err(|err| {
                    create_epg_error!(EpgErrorKind::Upstream, "Request failed: {} {err}", sanitize_sensitive_info(url))
                })?;
                Self::check_status(url, retry)
            }
            Ok(response) => Self::check_status(url, response),
            Err(err) => Err(create_epg_error!(
                EpgErrorKind::Upstream,
                "Request failed: {} {err}",
                sanitize_sensitive_info(url)
            )),
        }
    }

    fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, EpgError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(response)
        } else {
            Err(create_epg_error!(
                EpgErrorKind::Upstream,
                "Request failed with status {} {}",
                format_http_status(status),
                sanitize_sensitive_info(url)
            ))
        }
    }

    async fn store_response(
        &self,
        key: &str,
        url: &str,
        response: reqwest::Response,
        existing: Option<(PathBuf, bool)>,
        retention_days: u32,
    ) -> Result<MirrorFile, EpgError> {
        let is_gz = response_is_gzip(&response, url);
        let etag = header_value(&response, ETAG.as_str());
        let last_modified = header_value(&response, LAST_MODIFIED.as_str());

        if let Some((old_path, old_is_gz)) = existing {
            self.rotate_to_snapshot(key, &old_path, old_is_gz).await?;
        }

        let target = self.current_path(key, is_gz);
        let tmp = temp_path(&target);
        {
            let file = tokio::fs::File::create(&tmp).await.map_err(EpgError::from)?;
            let mut writer = async_file_writer(file);
            let stream = response.bytes_stream().map_err(std::io::Error::other);
            let mut reader = StreamReader::new(stream);
            tokio::io::copy(&mut reader, &mut writer).await.map_err(|err| {
                create_epg_error!(EpgErrorKind::Upstream, "Download failed: {} {err}", sanitize_sensitive_info(url))
            })?;
            writer.flush().await.map_err(EpgError::from)?;
        }
        tokio::fs::rename(&tmp, &target).await.map_err(EpgError::from)?;

        let meta = MirrorMeta {
            etag,
            last_modified,
            is_gz,
            saved_at: Utc::now().to_rfc3339(),
        };
        write_json_file(&self.meta_path(key), &meta).await.map_err(EpgError::from)?;

        self.prune_snapshots(key, retention_days, MIRROR_KEEP_MAX).await;

        debug!("Mirror updated for {}", sanitize_sensitive_info(url));
        Ok(MirrorFile { url: url.to_string(), path: target, is_gz })
    }

    /// Renames the current file to `<key>.<YYYYMMDDhhmmss>.xmltv[.gz]`.
    /// On a same-second collision the timestamp advances one second.
    async fn rotate_to_snapshot(&self, key: &str, current: &Path, is_gz: bool) -> Result<(), EpgError> {
        let ext = if is_gz { EXT_GZ } else { EXT_PLAIN };
        let mut stamp = Utc::now();
        for _ in 0..SNAPSHOT_COLLISION_RETRIES {
            let name = format!("{key}.{}.{ext}", stamp.format(XMLTV_DATETIME_FMT));
            let snapshot_path = self.dir.join(&name);
            if tokio::fs::metadata(&snapshot_path).await.is_ok() {
                stamp += Duration::seconds(1);
                continue;
            }
            tokio::fs::rename(current, &snapshot_path).await.map_err(|err| {
                create_epg_error!(EpgErrorKind::Io, "Snapshot rotation failed for {}: {err}", current.display())
            })?;
            return Ok(());
        }
        Err(create_epg_error!(
            EpgErrorKind::Io,
            "Snapshot rotation failed for {}: no free timestamp",
            current.display()
        ))
    }

    /// Snapshots for `url`, newest first.
    pub async fn list_snapshots(&self, url: &str) -> Vec<Snapshot> {
        let key = Self::url_key(url);
        let mut snapshots = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return snapshots;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(timestamp) = parse_snapshot_name(&name, &key) {
                snapshots.push(Snapshot { path: entry.path(), timestamp });
            }
        }
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        snapshots
    }

    /// Deletes snapshots older than `retention_days` or beyond `keep_max`
    /// when sorted newest-first.
    pub async fn prune_snapshots(&self, key: &str, retention_days: u32, keep_max: usize) {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let cutoff_stamp = cutoff.format(XMLTV_DATETIME_FMT).to_string();

        let mut snapshots = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(timestamp) = parse_snapshot_name(&name, key) {
                snapshots.push(Snapshot { path: entry.path(), timestamp });
            }
        }
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        for (index, snapshot) in snapshots.iter().enumerate() {
            if index >= keep_max || snapshot.timestamp < cutoff_stamp {
                if let Err(err) = tokio::fs::remove_file(&snapshot.path).await {
                    warn!("Failed to prune snapshot {}: {err}", snapshot.path.display());
                }
            }
        }
    }

    /// Cache signature of the mirror: validators, file size/mtime and the
    /// most recent snapshot timestamps.
    pub async fn signature(&self, url: &str) -> MirrorSignature {
        let key = Self::url_key(url);
        let meta = self.read_meta(&key).await.unwrap_or_default();
        let path = self.current_path(&key, meta.is_gz);
        let (size, mtime_ms) = match tokio::fs::metadata(&path).await {
            Ok(md) => {
                let mtime = md
                    .modified()
                    .ok()
                    .map_or(0, |t| DateTime::<Utc>::from(t).timestamp_millis());
                (md.len(), mtime)
            }
            Err(_) => (0, 0),
        };
        let snapshots = self
            .list_snapshots(url)
            .await
            .into_iter()
            .take(SIGNATURE_SNAPSHOT_COUNT)
            .map(|s| s.timestamp)
            .collect();
        MirrorSignature {
            url: url.to_string(),
            etag: meta.etag,
            last_modified: meta.last_modified,
            size,
            mtime_ms,
            snapshots,
        }
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

fn response_is_gzip(response: &reqwest::Response, url: &str) -> bool {
    if header_value(response, CONTENT_ENCODING.as_str()).is_some_and(|v| v.to_lowercase().contains("gzip")) {
        return true;
    }
    if header_value(response, CONTENT_TYPE.as_str()).is_some_and(|v| v.to_lowercase().contains("gzip")) {
        return true;
    }
    url.split(['?', '#']).next().unwrap_or(url).ends_with(".gz")
}

/// Matches `<key>.<YYYYMMDDhhmmss>.xmltv[.gz]` and yields the timestamp.
fn parse_snapshot_name(name: &str, key: &str) -> Option<String> {
    let rest = name.strip_prefix(key)?.strip_prefix('.')?;
    let (stamp, ext) = rest.split_once('.')?;
    if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, XMLTV_DATETIME_FMT).ok()?;
    matches!(ext, EXT_PLAIN | EXT_GZ).then(|| stamp.to_string())
}
