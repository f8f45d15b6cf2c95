use dashmap::DashMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::utils::{ensure_dir, now_millis, write_json_file};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
const MIN_CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct MemEntry {
    value: Arc<serde_json::Value>,
    expires_at: Instant,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskEntry {
    expires_at_ms: i64,
    data: serde_json::Value,
}

/// Two-tier TTL cache keyed by fingerprints: a concurrent memory map in
/// front of a directory of JSON blobs. Disk failures are logged, never
/// surfaced; the cache only ever degrades to recomputation.
pub struct ArtifactCache {
    dir: PathBuf,
    memory: DashMap<String, MemEntry>,
}

impl ArtifactCache {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        ensure_dir(&dir)?;
        Ok(Self { dir, memory: DashMap::new() })
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(entry) = self.memory.get(key) {
            if entry.expires_at > Instant::now() {
                let value = Arc::clone(&entry.value);
                drop(entry);
                return serde_json::from_value((*value).clone()).ok();
            }
            drop(entry);
            self.memory.remove(key);
        }

        // miss: try the disk tier and promote
        let disk: DiskEntry = crate::utils::read_json_file(&self.disk_path(key)).await.ok()?;
        let remaining_ms = disk.expires_at_ms - now_millis();
        if remaining_ms <= 0 {
            return None;
        }
        debug!("Cache promoted from disk: {key}");
        let value = Arc::new(disk.data);
        self.memory.insert(
            key.to_string(),
            MemEntry {
                value: Arc::clone(&value),
                expires_at: Instant::now() + Duration::from_millis(remaining_ms.unsigned_abs()),
            },
        );
        serde_json::from_value((*value).clone()).ok()
    }

    pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) {
        let ttl = ttl.max(MIN_CACHE_TTL);
        let Ok(value) = serde_json::to_value(data) else {
            warn!("Cache serialization failed for {key}");
            return;
        };
        let value = Arc::new(value);
        self.memory.insert(
            key.to_string(),
            MemEntry { value: Arc::clone(&value), expires_at: Instant::now() + ttl },
        );

        let disk = DiskEntry {
            expires_at_ms: now_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            data: (*value).clone(),
        };
        if let Err(err) = write_json_file(&self.disk_path(key), &disk).await {
            warn!("Cache disk write failed for {key}: {err}");
        }
    }
}
