//! Key-addressable byte stores backing the chunked array layout

use crate::error::{Result, VoxError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process memory
    Memory,
    /// Write-only archive container
    Archive,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                _ => Err(VoxError::Configuration(format!(
                    "Unknown store scheme: {}",
                    scheme
                ))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::FileSystem => "file",
            StorageBackend::Memory => "memory",
            StorageBackend::Archive => "archive",
        }
    }
}

/// Validate a store key: relative, `/`-separated, no empty or `..` segments.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(VoxError::StorageBackend(format!("invalid store key '{}'", key)));
    }
    Ok(())
}

/// A path-addressable byte store.
///
/// A dataset is written by one writer at a time; stores do not coordinate
/// concurrent writers to the same keys.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the value at `key`, failing with [`VoxError::NotFound`] if absent
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Write (or replace) the value at `key`
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete the value at `key`
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key under `prefix` (recursively), sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of the value at `key`
    async fn size(&self, key: &str) -> Result<usize>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;

    /// Read a value, returning `None` when absent
    async fn read_optional(&self, key: &str) -> Result<Option<Bytes>> {
        match self.read(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(VoxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// File system store
pub struct FileSystemStore {
    base_path: PathBuf,
}

impl FileSystemStore {
    /// Create a new file system store rooted at `base_path`
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the full path for a key
    fn full_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

fn not_found_or_io(key: &str, err: std::io::Error) -> VoxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        VoxError::NotFound(key.to_string())
    } else {
        VoxError::Io(err)
    }
}

#[async_trait]
impl Store for FileSystemStore {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let full_path = self.full_path(key)?;
        let data = fs::read(&full_path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key)?;

        // Create parent directories if they don't exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        fs::remove_file(&full_path)
            .await
            .map_err(|e| not_found_or_io(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(VoxError::Io(e)),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn size(&self, key: &str) -> Result<usize> {
        let full_path = self.full_path(key)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(metadata.len() as usize)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Bytes)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Snapshot of every entry, sorted by key
    pub fn entries(&self) -> Vec<(String, Bytes)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, key: &str) -> Result<Bytes> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| VoxError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.entries
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| VoxError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn size(&self, key: &str) -> Result<usize> {
        self.entries
            .read()
            .get(key)
            .map(|v| v.len())
            .ok_or_else(|| VoxError::NotFound(key.to_string()))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create the matching store
pub fn create_store(url: &str) -> Result<Box<dyn Store>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemStore::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryStore::new())),
        StorageBackend::Archive => Err(VoxError::Configuration(
            "archive stores are created by the exporter".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_system_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemStore::new(temp_dir.path());

        let data = b"Hello, voxpack!";
        store.write("zarr/a/0/0", data).await.unwrap();
        store.write("zarr/.zgroup", b"{}").await.unwrap();

        let read_data = store.read("zarr/a/0/0").await.unwrap();
        assert_eq!(&read_data[..], data);

        assert!(store.exists("zarr/a/0/0").await.unwrap());
        assert!(!store.exists("nonexistent.dat").await.unwrap());
        assert_eq!(store.size("zarr/a/0/0").await.unwrap(), data.len());
        assert_eq!(
            store.list("zarr/").await.unwrap(),
            vec!["zarr/.zgroup".to_string(), "zarr/a/0/0".to_string()]
        );

        store.delete("zarr/a/0/0").await.unwrap();
        assert!(!store.exists("zarr/a/0/0").await.unwrap());
        assert!(matches!(
            store.read("zarr/a/0/0").await.unwrap_err(),
            VoxError::NotFound(_)
        ));
        assert!(store.read_optional("zarr/a/0/0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.write("b", b"2").await.unwrap();
        store.write("a/x", b"1").await.unwrap();
        assert_eq!(store.list("").await.unwrap(), vec!["a/x", "b"]);
        assert_eq!(store.list("a/").await.unwrap(), vec!["a/x"]);
        assert_eq!(store.size("b").await.unwrap(), 1);
        assert!(store.delete("missing").await.is_err());
        assert_eq!(store.backend(), StorageBackend::Memory);
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("zarr/a/.zarray").is_ok());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("memory://scratch").unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            StorageBackend::from_url("/plain/path").unwrap(),
            StorageBackend::FileSystem
        );
        assert!(StorageBackend::from_url("s3://bucket").is_err());
    }

    #[test]
    fn test_create_store() {
        assert_eq!(create_store("memory://scratch").unwrap().backend(), StorageBackend::Memory);
        assert_eq!(
            create_store("file:///tmp/voxpack").unwrap().backend(),
            StorageBackend::FileSystem
        );
        assert!(create_store("s3://bucket").is_err());
        assert_eq!(StorageBackend::from_url("relative/dir").unwrap().as_str(), "file");
    }

    #[tokio::test]
    async fn test_created_store_resolves_file_url() {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("file://{}", temp_dir.path().display());
        let store = create_store(&url).unwrap();
        store.write("zarr/.zgroup", b"{}").await.unwrap();
        assert!(temp_dir.path().join("zarr/.zgroup").exists());
    }
}
