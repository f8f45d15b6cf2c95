use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::EpgChannel;
use crate::utils::{ensure_dir, write_json_file};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChannels {
    pub channels: Vec<EpgChannel>,
    pub scanned_at: String,
}

/// Persisted rescan results, one JSON file per source id.
pub struct SourceChannelCache {
    dir: PathBuf,
}

impl SourceChannelCache {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, source_id: &str) -> PathBuf {
        let safe: String = source_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub async fn read(&self, source_id: &str) -> Option<SourceChannels> {
        crate::utils::read_json_file(&self.path(source_id)).await.ok()
    }

    pub async fn write(&self, source_id: &str, channels: &SourceChannels) -> std::io::Result<()> {
        write_json_file(&self.path(source_id), channels).await
    }

    pub async fn remove(&self, source_id: &str) {
        let _ = tokio::fs::remove_file(self.path(source_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceChannelCache::new(dir.path().to_path_buf()).unwrap();
        let record = SourceChannels {
            channels: vec![EpgChannel { id: "bbc1".to_string(), display_name: Some("BBC 1".to_string()), icon_url: None }],
            scanned_at: "2024-06-10T12:00:00Z".to_string(),
        };
        cache.write("src-1", &record).await.unwrap();
        let read = cache.read("src-1").await.unwrap();
        assert_eq!(read.channels.len(), 1);
        assert_eq!(read.channels[0].id, "bbc1");
        cache.remove("src-1").await;
        assert!(cache.read("src-1").await.is_none());
    }

    #[tokio::test]
    async fn test_id_is_sanitized_for_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceChannelCache::new(dir.path().to_path_buf()).unwrap();
        let record = SourceChannels { channels: vec![], scanned_at: String::new() };
        cache.write("../evil/id", &record).await.unwrap();
        assert!(cache.read("../evil/id").await.is_some());
        assert!(dir.path().join("___evil_id.json").exists());
    }
}
