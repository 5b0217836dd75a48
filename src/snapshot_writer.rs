//! Freezing a state repository into a snapshot object.
//!
//! A snapshot is first written to a local temporary file, then uploaded to
//! the [`BlobStore`]. The temporary file is owned by a [`LocalSnapshot`]
//! whose drop removes it, so it is gone on every exit path: after a
//! successful upload, after a failed upload, after a failed local write, and
//! when the calling future is cancelled.

use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::NamedTempFile;

use crate::codec::Codec;
use crate::error::SnapshotError;
use crate::position::OffsetVector;
use crate::projection::StateRepository;
use crate::snapshot::{self, SNAPSHOT_EXTENSION, SnapshotEntry};
use crate::storage::BlobStore;

/// Local and retention settings for snapshot writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Directory the temporary snapshot file is created in.
    /// Defaults to [`std::env::temp_dir`].
    pub temp_dir: PathBuf,
    /// Number of most recent snapshots kept per stream after a successful
    /// upload. `0` disables pruning. Defaults to 3.
    pub snapshots_to_keep: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            snapshots_to_keep: 3,
        }
    }
}

/// A fully written snapshot file awaiting upload.
///
/// Dropping it deletes the file.
#[derive(Debug)]
pub struct LocalSnapshot {
    file: NamedTempFile,
    name: String,
    entries: u64,
}

impl LocalSnapshot {
    /// Blob name the snapshot will be uploaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the local file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of state entries written after the header.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Delete the local file, reporting failure.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the file cannot be removed.
    pub fn close(self) -> std::io::Result<()> {
        self.file.close()
    }
}

/// Writes snapshots of a `StateRepository<T>` with codec `C`.
pub struct SnapshotWriter<T, C: ?Sized> {
    store: Arc<dyn BlobStore>,
    codec: Arc<C>,
    config: SnapshotConfig,
    _marker: PhantomData<fn(&T)>,
}

impl<T, C: Codec<T> + ?Sized> SnapshotWriter<T, C> {
    /// Create a writer uploading to `store` with default settings.
    pub fn new(store: Arc<dyn BlobStore>, codec: Arc<C>) -> Self {
        Self {
            store,
            codec,
            config: SnapshotConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Replace the writer settings.
    pub fn with_config(mut self, config: SnapshotConfig) -> Self {
        self.config = config;
        self
    }

    /// The writer settings.
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Write `position` and every entry of `repository` to a local temporary
    /// file.
    ///
    /// The repository is read entry by entry while other tasks may still be
    /// writing to it, so concurrent updates may or may not be included.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if a value cannot be encoded and
    /// [`SnapshotError::Io`] if the file cannot be written. The partial file
    /// is deleted before the error is returned.
    pub fn create_snapshot(
        &self,
        stream: &str,
        position: &OffsetVector,
        repository: &dyn StateRepository<T>,
    ) -> Result<LocalSnapshot, SnapshotError> {
        let name = snapshot::snapshot_name(stream, now_millis());
        let (contents, entries) = self.encode(position, repository)?;
        let local = write_local(&self.config.temp_dir, name, &contents, entries)?;
        tracing::debug!(
            stream,
            name = %local.name,
            entries,
            path = %local.path().display(),
            "snapshot written locally"
        );
        Ok(local)
    }

    /// Encode the header line and one line per repository entry.
    fn encode(
        &self,
        position: &OffsetVector,
        repository: &dyn StateRepository<T>,
    ) -> Result<(Vec<u8>, u64), SnapshotError> {
        let header = SnapshotEntry::header(position).map_err(|source| SnapshotError::Encode {
            key: snapshot::HEADER_KEY.to_owned(),
            source,
        })?;

        let mut contents = Vec::new();
        header.write_line(&mut contents)?;

        let mut entries: u64 = 0;
        let mut failure: Option<SnapshotError> = None;
        repository.for_each(&mut |key, value| {
            if failure.is_some() {
                return;
            }
            let bytes = match self.codec.encode(value) {
                Ok(bytes) => bytes,
                Err(source) => {
                    failure = Some(SnapshotError::Encode {
                        key: key.to_owned(),
                        source,
                    });
                    return;
                }
            };
            entries += 1;
            if let Err(e) = SnapshotEntry::state(key, entries, &bytes).write_line(&mut contents) {
                failure = Some(e.into());
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok((contents, entries)),
        }
    }

    /// Write a snapshot of `repository` at `position` and upload it.
    ///
    /// Entries are encoded on the calling task. The local file is written and
    /// synced on the blocking pool so the runtime's workers never wait on
    /// disk. If the returned future is dropped mid-write, the file is deleted
    /// once the blocking write finishes.
    ///
    /// # Returns
    ///
    /// The name of the uploaded snapshot.
    ///
    /// # Errors
    ///
    /// Returns the [`create_snapshot`](Self::create_snapshot) error or
    /// [`SnapshotError::Upload`]. In every case the local file has been
    /// removed by the time the error is returned.
    pub async fn take_snapshot(
        &self,
        stream: &str,
        position: &OffsetVector,
        repository: &dyn StateRepository<T>,
    ) -> Result<String, SnapshotError> {
        let name = snapshot::snapshot_name(stream, now_millis());
        let (contents, entries) = self.encode(position, repository)?;

        let temp_dir = self.config.temp_dir.clone();
        let local = tokio::task::spawn_blocking(move || write_local(&temp_dir, name, &contents, entries))
            .await
            .map_err(|e| SnapshotError::Io(std::io::Error::other(e)))??;
        tracing::debug!(
            stream,
            name = %local.name,
            entries,
            path = %local.path().display(),
            "snapshot written locally"
        );

        let name = local.name().to_owned();
        let uploaded = self.store.put_file(&name, local.path()).await;

        let path = local.path().to_path_buf();
        if let Err(e) = local.close() {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to delete local snapshot file"
            );
        }

        uploaded.map_err(|source| SnapshotError::Upload {
            name: name.clone(),
            source,
        })?;
        tracing::info!(stream, name = %name, entries, "snapshot uploaded");

        self.prune(stream).await;
        Ok(name)
    }

    /// Delete snapshots of `stream` beyond the configured retention.
    async fn prune(&self, stream: &str) {
        if self.config.snapshots_to_keep == 0 {
            return;
        }
        let names = match self.store.list(&snapshot::snapshot_prefix(stream)).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(stream, error = %e, "failed to list snapshots for pruning");
                return;
            }
        };

        // Ascending names list the newest snapshot first.
        let expired: Vec<String> = names
            .into_iter()
            .filter(|name| snapshot::snapshot_timestamp(stream, name).is_some())
            .skip(self.config.snapshots_to_keep)
            .collect();
        if expired.is_empty() {
            return;
        }

        match self.store.delete(&expired).await {
            Ok(()) => tracing::info!(stream, pruned = expired.len(), "old snapshots pruned"),
            Err(e) => tracing::warn!(stream, error = %e, "failed to prune old snapshots"),
        }
    }
}

/// Write `contents` to a fresh temporary file in `temp_dir` and sync it.
fn write_local(
    temp_dir: &Path,
    name: String,
    contents: &[u8],
    entries: u64,
) -> Result<LocalSnapshot, SnapshotError> {
    let stem = name.strip_suffix(SNAPSHOT_EXTENSION).unwrap_or(&name);
    let mut file = tempfile::Builder::new()
        .prefix(stem)
        .suffix(SNAPSHOT_EXTENSION)
        .tempfile_in(temp_dir)?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        writer.write_all(contents)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    Ok(LocalSnapshot {
        file,
        name,
        entries,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
