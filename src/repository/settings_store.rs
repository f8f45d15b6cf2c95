use arc_swap::ArcSwap;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{info_err, EpgError, EpgErrorKind};
use crate::model::SettingsDocument;
use crate::utils::{path_exists, short_hash, write_json_file};

/// Process-wide settings/sources/mappings with snapshot semantics: readers
/// load an immutable `Arc`, writers persist the new document before it is
/// swapped in. Writes are serialized through a single async mutex.
pub struct SettingsStore {
    path: PathBuf,
    current: ArcSwap<SettingsDocument>,
    write_guard: Mutex<()>,
}

impl SettingsStore {
    pub async fn load(path: PathBuf) -> Result<Self, EpgError> {
        let document = if path_exists(&path) {
            crate::utils::read_json_file::<SettingsDocument>(&path)
                .await
                .map_err(|err| info_err!("Failed to read settings {}: {err}", path.display()))?
        } else {
            info!("No settings file at {}, starting with defaults", path.display());
            SettingsDocument::default()
        };
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(document),
            write_guard: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<SettingsDocument> {
        self.current.load_full()
    }

    /// Applies `mutate` to a copy of the current document, persists it and
    /// swaps it in. Readers observe either the prior or the new snapshot.
    pub async fn update<F>(&self, mutate: F) -> Result<Arc<SettingsDocument>, EpgError>
    where
        F: FnOnce(&mut SettingsDocument),
    {
        let _guard = self.write_guard.lock().await;
        let mut document = (*self.current.load_full()).clone();
        mutate(&mut document);
        write_json_file(&self.path, &document).await?;
        let document = Arc::new(document);
        self.current.store(Arc::clone(&document));
        Ok(document)
    }
}

/// Opaque stable id for a newly registered source.
pub fn generate_source_id(url: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    short_hash(&format!("{url}:{nanos}"))
}
