use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const IO_BUFFER_SIZE: usize = 256 * 1024; // 256kb

pub fn file_writer<W>(w: W) -> std::io::BufWriter<W>
where
    W: std::io::Write,
{
    std::io::BufWriter::with_capacity(IO_BUFFER_SIZE, w)
}

pub fn async_file_writer<W>(w: W) -> tokio::io::BufWriter<W>
where
    W: tokio::io::AsyncWrite,
{
    tokio::io::BufWriter::with_capacity(IO_BUFFER_SIZE, w)
}

pub fn async_file_reader<R>(r: R) -> tokio::io::BufReader<R>
where
    R: tokio::io::AsyncRead,
{
    tokio::io::BufReader::with_capacity(IO_BUFFER_SIZE, r)
}

pub fn path_exists(file_path: &Path) -> bool {
    if let Ok(metadata) = std::fs::metadata(file_path) {
        return metadata.is_file();
    }
    false
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn resolve_directory_path(input: &str) -> PathBuf {
    let current_dir = std::env::current_dir().unwrap_or_default();
    if input.is_empty() {
        return current_dir;
    }
    let input_path = PathBuf::from(input);
    if let Err(e) = std::fs::create_dir_all(&input_path) {
        error!("Failed to create directory: {} - {e}", input_path.display());
    }
    input_path.canonicalize().unwrap_or_else(|_| current_dir.join(input))
}

pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map_or_else(String::new, |n| n.to_string_lossy().to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Writes `bytes` to a sibling `*.tmp` file and renames it over `path`.
/// The destination either keeps its old content or receives the full new content.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_path(path);
    {
        let file = tokio::fs::File::create(&tmp).await?;
        let mut writer = async_file_writer(file);
        writer.write_all(bytes).await?;
        writer.flush().await?;
    }
    tokio::fs::rename(&tmp, path).await
}

pub async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(crate::error::to_io_error)?;
    atomic_write(path, &json).await
}

pub async fn read_json_file<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(crate::error::to_io_error)
}

#[cfg(test)]
mod tests {
    use super::{atomic_write, temp_path};
    use std::path::Path;

    #[test]
    fn test_temp_path_appends_suffix() {
        let tmp = temp_path(Path::new("/data/mirror/abc.xmltv.gz"));
        assert_eq!(tmp, Path::new("/data/mirror/abc.xmltv.gz.tmp"));
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.json");
        atomic_write(&target, b"{}").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{}");
        assert!(!temp_path(&target).exists());
    }
}
