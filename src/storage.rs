//! Blob storage for snapshot objects.
//!
//! Snapshots live in a flat namespace of named blobs. [`BlobStore`] is the
//! capability contract; [`FilesystemBlobStore`] keeps one file per blob in a
//! directory and [`InMemoryBlobStore`] keeps them in a map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs;

use crate::error::TransportError;

/// Named blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name`, replacing any previous blob.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the blob cannot be written.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError>;

    /// Fetch the blob stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the blob is missing or cannot be read.
    async fn get(&self, name: &str) -> Result<Vec<u8>, TransportError>;

    /// Names of all blobs starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the store cannot be listed.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransportError>;

    /// Delete the named blobs. Missing names are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if a deletion fails.
    async fn delete(&self, names: &[String]) -> Result<(), TransportError>;

    /// Upload the contents of a local file.
    ///
    /// The default reads the whole file and calls [`put`](BlobStore::put).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the file cannot be read or the upload
    /// fails.
    async fn put_file(&self, name: &str, path: &Path) -> Result<(), TransportError> {
        let bytes = fs::read(path).await?;
        self.put(name, &bytes).await
    }

    /// Download a blob into a local file, replacing its contents.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the download or the local write fails.
    async fn get_file(&self, name: &str, path: &Path) -> Result<(), TransportError> {
        let bytes = self.get(name).await?;
        fs::write(path, bytes).await?;
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), TransportError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(TransportError::new(format!("invalid blob name '{name}'")));
    }
    Ok(())
}

/// [`BlobStore`] storing each blob as a file in a single directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// listing never shows a partially written blob.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
}

impl FilesystemBlobStore {
    /// Open a store rooted at `base_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the directory cannot be created.
    pub async fn open(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// Returns the directory blobs are stored in.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, TransportError> {
        check_name(name)?;
        Ok(self.base_dir.join(name))
    }

    fn staging_path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!(".{name}.tmp"))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let path = self.path_for(name)?;
        let staging = self.staging_path_for(name);
        fs::write(&staging, bytes).await?;
        fs::rename(&staging, &path).await?;
        tracing::debug!(name, size = bytes.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        let path = self.path_for(name)?;
        Ok(fs::read(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransportError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with(prefix)
                && !name.starts_with('.')
            {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, names: &[String]) -> Result<(), TransportError> {
        for name in names {
            let path = self.path_for(name)?;
            match fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(name = %name, "deleted blob"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn put_file(&self, name: &str, path: &Path) -> Result<(), TransportError> {
        let target = self.path_for(name)?;
        let staging = self.staging_path_for(name);
        let size = fs::copy(path, &staging).await?;
        fs::rename(&staging, &target).await?;
        tracing::debug!(name, size, "stored blob from file");
        Ok(())
    }

    async fn get_file(&self, name: &str, path: &Path) -> Result<(), TransportError> {
        let source = self.path_for(name)?;
        fs::copy(&source, path).await?;
        Ok(())
    }
}

/// [`BlobStore`] held in memory, with switches to simulate failures.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upload fail.
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::Release);
    }

    /// Make every subsequent deletion fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Release);
    }

    /// Names of all stored blobs, in ascending order.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError> {
        check_name(name)?;
        if self.fail_uploads.load(Ordering::Acquire) {
            return Err(TransportError::new(format!("upload of '{name}' rejected")));
        }
        self.lock().insert(name.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::new(format!("blob '{name}' not found")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .lock()
            .range(prefix.to_owned()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn delete(&self, names: &[String]) -> Result<(), TransportError> {
        if self.fail_deletes.load(Ordering::Acquire) {
            return Err(TransportError::new("deletion rejected"));
        }
        let mut blobs = self.lock();
        for name in names {
            blobs.remove(name);
        }
        Ok(())
    }
}
